use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::{monitor::MonitorConfig, proxy::ProxyConfig, supervisor::SupervisorConfig};

#[derive(Debug, Parser)]
#[command(
    name = "pier",
    author,
    version,
    about = "Per-tenant process orchestrator"
)]
pub struct Cli {
    /// Address the operator API, signed API and realtime gateway listen on.
    #[arg(long, env = "PIER_LISTEN_ADDR", default_value = "127.0.0.1:4000")]
    pub listen_addr: String,

    /// Host tenant processes bind to; written into proxy_pass.
    #[arg(long, env = "PIER_PUBLIC_HOST", default_value = "localhost")]
    pub public_host: String,

    /// Base URL tenant processes use to call back. Defaults to the listen address.
    #[arg(long, env = "PIER_ORCHESTRATOR_URL")]
    pub orchestrator_url: Option<String>,

    /// Program started for each tenant.
    #[arg(long, env = "PIER_TENANT_COMMAND", default_value = "node")]
    pub tenant_command: String,

    /// Arguments for the tenant program; `{port}` and `{host}` are substituted.
    #[arg(
        long = "tenant-arg",
        env = "PIER_TENANT_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_value = "dist/server.js"
    )]
    pub tenant_args: Vec<String>,

    /// Working directory tenant processes start in.
    #[arg(long, env = "PIER_TENANT_WORKDIR", default_value = "./tenant-server")]
    pub tenant_workdir: PathBuf,

    /// Value of the mode variable handed to every tenant process.
    #[arg(long, env = "PIER_TENANT_MODE_VALUE", default_value = "production")]
    pub tenant_mode: String,

    /// Suffix used when a tenant is created without an explicit domain.
    #[arg(long, env = "PIER_DOMAIN_SUFFIX", default_value = "localhost")]
    pub domain_suffix: String,

    /// Directory nginx includes tenant vhosts from.
    #[arg(long, env = "PIER_PROXY_SITES_DIR", default_value = "./nginx/sites-enabled")]
    pub proxy_sites_dir: PathBuf,

    /// Command run after a vhost changes. Empty disables reloading.
    #[arg(long, env = "PIER_PROXY_RELOAD_COMMAND", default_value = "nginx -s reload")]
    pub proxy_reload_command: String,

    #[arg(long, env = "PIER_PROXY_RELOAD_TIMEOUT_SECS", default_value_t = 10)]
    pub proxy_reload_timeout_secs: u64,

    /// An exit inside this window fails the start.
    #[arg(long, env = "PIER_SPAWN_CONFIRM_MS", default_value_t = 600)]
    pub spawn_confirm_ms: u64,

    /// Optional TCP readiness probe after the confirmation window.
    #[arg(long, env = "PIER_READINESS_TIMEOUT_MS")]
    pub readiness_timeout_ms: Option<u64>,

    /// Time between SIGTERM and SIGKILL.
    #[arg(long, env = "PIER_STOP_GRACE_SECS", default_value_t = 5)]
    pub stop_grace_secs: u64,

    /// How long a stop waits for the exit before answering.
    #[arg(long, env = "PIER_STOP_WAIT_MS", default_value_t = 6_000)]
    pub stop_wait_ms: u64,

    #[arg(long, env = "PIER_MONITOR_INTERVAL_SECS", default_value_t = 5)]
    pub monitor_interval_secs: u64,

    /// CPU percent above which a tenant process is restarted.
    #[arg(long, env = "PIER_CPU_THRESHOLD", default_value_t = 60.0)]
    pub cpu_threshold: f32,

    #[arg(long, env = "PIER_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub sweep_interval_secs: u64,

    /// Empty tenant buckets idle this long are dropped from the registry.
    #[arg(long, env = "PIER_IDLE_THRESHOLD_SECS", default_value_t = 3_600)]
    pub idle_threshold_secs: u64,

    /// Accepted clock skew for signed tenant calls.
    #[arg(long, env = "PIER_REPLAY_WINDOW_SECS", default_value_t = 60)]
    pub replay_window_secs: u64,

    /// Secret for realtime registration tokens. Generated per run when unset.
    #[arg(long, env = "PIER_REALTIME_TOKEN_SECRET", hide_env_values = true)]
    pub realtime_token_secret: Option<String>,

    /// Bearer token for operator routes. Unset leaves them open (development).
    #[arg(long, env = "PIER_OPERATOR_TOKEN", hide_env_values = true)]
    pub operator_token: Option<String>,

    /// JSON array of tenants loaded at startup.
    #[arg(long, env = "PIER_TENANT_SEED")]
    pub tenant_seed: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PierConfig {
    pub listen_addr: SocketAddr,
    pub public_host: String,
    pub orchestrator_url: String,
    pub tenant_command: String,
    pub tenant_args: Vec<String>,
    pub tenant_workdir: PathBuf,
    pub tenant_mode: String,
    pub domain_suffix: String,
    pub proxy_sites_dir: PathBuf,
    pub proxy_reload_command: Vec<String>,
    pub proxy_reload_timeout: Duration,
    pub spawn_confirm: Duration,
    pub readiness_timeout: Option<Duration>,
    pub stop_grace: Duration,
    pub stop_wait: Duration,
    pub monitor_interval: Duration,
    pub cpu_threshold: f32,
    pub sweep_interval: Duration,
    pub idle_threshold: Duration,
    pub replay_window: Duration,
    pub realtime_token_secret: Option<String>,
    pub operator_token: Option<String>,
    pub tenant_seed: Option<PathBuf>,
}

impl TryFrom<Cli> for PierConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        if cli.tenant_command.trim().is_empty() {
            bail!("tenant command must not be empty");
        }
        if !(cli.cpu_threshold > 0.0 && cli.cpu_threshold.is_finite()) {
            bail!("cpu threshold must be a positive number, got {}", cli.cpu_threshold);
        }
        for (name, value) in [
            ("spawn confirmation window", cli.spawn_confirm_ms),
            ("monitor interval", cli.monitor_interval_secs),
            ("sweep interval", cli.sweep_interval_secs),
            ("replay window", cli.replay_window_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }

        let orchestrator_url = cli
            .orchestrator_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{listen_addr}"));

        Ok(PierConfig {
            listen_addr,
            public_host: cli.public_host,
            orchestrator_url,
            tenant_command: cli.tenant_command,
            tenant_args: cli
                .tenant_args
                .into_iter()
                .filter(|arg| !arg.is_empty())
                .collect(),
            tenant_workdir: cli.tenant_workdir,
            tenant_mode: cli.tenant_mode,
            domain_suffix: cli.domain_suffix.trim_start_matches('.').to_string(),
            proxy_sites_dir: cli.proxy_sites_dir,
            proxy_reload_command: cli
                .proxy_reload_command
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            proxy_reload_timeout: Duration::from_secs(cli.proxy_reload_timeout_secs),
            spawn_confirm: Duration::from_millis(cli.spawn_confirm_ms),
            readiness_timeout: cli.readiness_timeout_ms.map(Duration::from_millis),
            stop_grace: Duration::from_secs(cli.stop_grace_secs),
            stop_wait: Duration::from_millis(cli.stop_wait_ms),
            monitor_interval: Duration::from_secs(cli.monitor_interval_secs),
            cpu_threshold: cli.cpu_threshold,
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            idle_threshold: Duration::from_secs(cli.idle_threshold_secs),
            replay_window: Duration::from_secs(cli.replay_window_secs),
            realtime_token_secret: cli.realtime_token_secret.filter(|s| !s.is_empty()),
            operator_token: cli.operator_token.filter(|s| !s.is_empty()),
            tenant_seed: cli.tenant_seed,
        })
    }
}

impl PierConfig {
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            command: self.tenant_command.clone(),
            args: self.tenant_args.clone(),
            work_dir: self.tenant_workdir.clone(),
            public_host: self.public_host.clone(),
            mode: self.tenant_mode.clone(),
            orchestrator_url: self.orchestrator_url.clone(),
            confirm_window: self.spawn_confirm,
            stop_grace: self.stop_grace,
            stop_wait: self.stop_wait,
            readiness_timeout: self.readiness_timeout,
        }
    }

    pub fn proxy(&self) -> ProxyConfig {
        ProxyConfig {
            sites_dir: self.proxy_sites_dir.clone(),
            upstream_host: self.public_host.clone(),
            reload_command: self.proxy_reload_command.clone(),
            reload_timeout: self.proxy_reload_timeout,
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.monitor_interval,
            cpu_threshold: self.cpu_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<PierConfig> {
        let cli = Cli::try_parse_from(std::iter::once("pier").chain(args.iter().copied()))?;
        PierConfig::try_from(cli)
    }

    #[test_timeout::timeout]
    fn defaults_match_documented_behaviour() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.orchestrator_url, "http://127.0.0.1:4000");
        assert_eq!(config.spawn_confirm, Duration::from_millis(600));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.cpu_threshold, 60.0);
        assert_eq!(config.replay_window, Duration::from_secs(60));
        assert_eq!(config.idle_threshold, Duration::from_secs(3_600));
        assert_eq!(config.proxy_reload_command, vec!["nginx", "-s", "reload"]);
        assert!(config.operator_token.is_none());
    }

    #[test_timeout::timeout]
    fn tenant_args_split_on_commas() {
        let config = parse(&["--tenant-arg", "server.js,--port,{port}"]).unwrap();
        assert_eq!(config.tenant_args, vec!["server.js", "--port", "{port}"]);
        assert_eq!(config.supervisor().args.len(), 3);
    }

    #[test_timeout::timeout]
    fn empty_reload_command_disables_reload() {
        let config = parse(&["--proxy-reload-command", ""]).unwrap();
        assert!(config.proxy().reload_command.is_empty());
    }

    #[test_timeout::timeout]
    fn invalid_values_are_rejected() {
        assert!(parse(&["--listen-addr", "nowhere"]).is_err());
        assert!(parse(&["--cpu-threshold", "0"]).is_err());
        assert!(parse(&["--monitor-interval-secs", "0"]).is_err());
    }
}
