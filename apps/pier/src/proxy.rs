use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use metrics::counter;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Directory the reverse proxy includes vhost files from.
    pub sites_dir: PathBuf,
    /// Host written into `proxy_pass`.
    pub upstream_host: String,
    /// Program and arguments; empty disables reloading.
    pub reload_command: Vec<String>,
    pub reload_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("domain {0:?} cannot be used as a server name")]
    InvalidDomain(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,
    Failed,
    TimedOut,
    Skipped,
}

impl ReloadOutcome {
    fn metric_label(self) -> &'static str {
        match self {
            ReloadOutcome::Reloaded => "reloaded",
            ReloadOutcome::Failed => "failed",
            ReloadOutcome::TimedOut => "timed_out",
            ReloadOutcome::Skipped => "skipped",
        }
    }
}

/// Writes one nginx server block per tenant and asks nginx to reload.
#[derive(Debug, Clone)]
pub struct ReverseProxyConfigurator {
    config: ProxyConfig,
}

impl ReverseProxyConfigurator {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn vhost_path(&self, domain: &str) -> PathBuf {
        self.config
            .sites_dir
            .join(vhost_file_name(&normalize_domain(domain)))
    }

    /// Writes the vhost for `domain` and schedules a reload in the background.
    /// Reload failures are logged, never returned.
    pub async fn publish(&self, domain: &str, port: u16) -> Result<PathBuf, ProxyError> {
        let server_name = checked_server_name(domain)?;
        let path = self.write_vhost(&server_name, port).await?;
        self.schedule_reload();
        Ok(path)
    }

    /// Moves the tenant to `new_domain`. The new vhost is written before the
    /// old one is removed, so a rejected domain leaves the live vhost in place.
    pub async fn republish(
        &self,
        old_domain: &str,
        new_domain: &str,
        port: u16,
    ) -> Result<PathBuf, ProxyError> {
        let server_name = checked_server_name(new_domain)?;
        let path = self.write_vhost(&server_name, port).await?;
        let old_path = self.vhost_path(old_domain);
        if old_path != path {
            remove_if_present(&old_path).await?;
        }
        self.schedule_reload();
        Ok(path)
    }

    async fn write_vhost(&self, server_name: &str, port: u16) -> Result<PathBuf, ProxyError> {
        tokio::fs::create_dir_all(&self.config.sites_dir)
            .await
            .map_err(|source| ProxyError::Io {
                path: self.config.sites_dir.clone(),
                source,
            })?;

        let path = self.config.sites_dir.join(vhost_file_name(server_name));
        let body = render_vhost(server_name, &self.config.upstream_host, port);
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| ProxyError::Io {
                path: path.clone(),
                source,
            })?;
        info!(domain = %server_name, port, path = %path.display(), "vhost written");
        Ok(path)
    }

    fn schedule_reload(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.reload().await;
        });
    }

    pub async fn reload(&self) -> ReloadOutcome {
        let outcome = match self.config.reload_command.split_first() {
            None => ReloadOutcome::Skipped,
            Some((program, args)) => {
                let status = Command::new(program).args(args).kill_on_drop(true).status();
                match tokio::time::timeout(self.config.reload_timeout, status).await {
                    Ok(Ok(status)) if status.success() => ReloadOutcome::Reloaded,
                    Ok(Ok(status)) => {
                        warn!(command = %program, %status, "proxy reload exited unsuccessfully");
                        ReloadOutcome::Failed
                    }
                    Ok(Err(err)) => {
                        warn!(command = %program, error = %err, "proxy reload could not run");
                        ReloadOutcome::Failed
                    }
                    Err(_) => {
                        warn!(
                            command = %program,
                            timeout_ms = self.config.reload_timeout.as_millis() as u64,
                            "proxy reload timed out"
                        );
                        ReloadOutcome::TimedOut
                    }
                }
            }
        };
        counter!("pier_proxy_reloads_total", "outcome" => outcome.metric_label()).increment(1);
        debug!(outcome = outcome.metric_label(), "proxy reload finished");
        outcome
    }
}

/// Lowercases, drops quotes and whitespace, and strips diacritics.
pub fn normalize_domain(raw: &str) -> String {
    raw.nfd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| !c.is_whitespace() && *c != '"' && *c != '\'')
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn vhost_file_name(domain: &str) -> String {
    let stem: String = domain
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' => c,
            _ => '_',
        })
        .collect();
    format!("{stem}.conf")
}

pub fn render_vhost(server_name: &str, host: &str, port: u16) -> String {
    format!(
        "server {{\n    listen 80;\n    server_name {server_name};\n\n    location / {{\n        proxy_pass http://{host}:{port};\n        proxy_http_version 1.1;\n        proxy_set_header Upgrade $http_upgrade;\n        proxy_set_header Connection \"upgrade\";\n        proxy_set_header Host $host;\n        proxy_set_header X-Real-IP $remote_addr;\n        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n    }}\n}}\n"
    )
}

fn checked_server_name(domain: &str) -> Result<String, ProxyError> {
    let server_name = normalize_domain(domain);
    if is_valid_server_name(&server_name) {
        Ok(server_name)
    } else {
        Err(ProxyError::InvalidDomain(domain.to_string()))
    }
}

// Anything outside hostname characters could break out of the server block.
fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'))
}

async fn remove_if_present(path: &Path) -> Result<(), ProxyError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "vhost removed");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ProxyError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configurator(dir: &Path, reload: &[&str]) -> ReverseProxyConfigurator {
        ReverseProxyConfigurator::new(ProxyConfig {
            sites_dir: dir.to_path_buf(),
            upstream_host: "localhost".into(),
            reload_command: reload.iter().map(|s| s.to_string()).collect(),
            reload_timeout: Duration::from_secs(2),
        })
    }

    #[test_timeout::timeout]
    fn normalizes_domains() {
        assert_eq!(normalize_domain("Café Olé.Example.COM"), "cafeole.example.com");
        assert_eq!(normalize_domain("\"acme.test\""), "acme.test");
        assert_eq!(normalize_domain("  Señor.io "), "senor.io");
    }

    #[test_timeout::timeout]
    fn file_names_are_sanitized() {
        assert_eq!(vhost_file_name("acme.example.com"), "acme.example.com.conf");
        assert_eq!(vhost_file_name("Weird/Name*"), "weird_name_.conf");
    }

    #[test_timeout::tokio_timeout_test]
    async fn publish_writes_server_block() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = configurator(dir.path(), &[]);
        let path = proxy.publish("Acme.Test", 1001).await.unwrap();

        assert_eq!(path, dir.path().join("acme.test.conf"));
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("server_name acme.test;"));
        assert!(body.contains("proxy_pass http://localhost:1001;"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn republish_replaces_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = configurator(dir.path(), &[]);
        let old = proxy.publish("old.test", 1001).await.unwrap();
        let new = proxy.republish("old.test", "new.test", 1001).await.unwrap();

        assert!(!old.exists());
        let body = std::fs::read_to_string(new).unwrap();
        assert!(body.contains("server_name new.test;"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_republish_keeps_live_vhost() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = configurator(dir.path(), &[]);
        let live = proxy.publish("acme.localhost", 1001).await.unwrap();

        let err = proxy
            .republish("acme.localhost", "evil.test;}", 1001)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidDomain(_)));
        let body = std::fs::read_to_string(&live).unwrap();
        assert!(body.contains("server_name acme.localhost;"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn republish_to_same_domain_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = configurator(dir.path(), &[]);
        let live = proxy.publish("acme.localhost", 1001).await.unwrap();
        let again = proxy
            .republish("acme.localhost", "ACME.localhost", 1001)
            .await
            .unwrap();

        assert_eq!(live, again);
        assert!(again.exists());
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejects_injection_in_domain() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = configurator(dir.path(), &[]);
        let err = proxy.publish("evil.test;}", 1001).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidDomain(_)));
        assert!(matches!(
            proxy.publish("   ", 1001).await,
            Err(ProxyError::InvalidDomain(_))
        ));
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn reload_reports_outcome() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(configurator(dir.path(), &[]).reload().await, ReloadOutcome::Skipped);
        assert_eq!(
            configurator(dir.path(), &["true"]).reload().await,
            ReloadOutcome::Reloaded
        );
        assert_eq!(
            configurator(dir.path(), &["false"]).reload().await,
            ReloadOutcome::Failed
        );
        assert_eq!(
            configurator(dir.path(), &["/nonexistent/nginx", "-s", "reload"])
                .reload()
                .await,
            ReloadOutcome::Failed
        );
    }
}
