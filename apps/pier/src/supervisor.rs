use std::{
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use metrics::{counter, gauge};
use pier_trust::env;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::TcpStream,
    process::{Child, Command},
    sync::{oneshot, watch},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    monitor::{CpuHistory, Fleet, MonitorTarget, UsageSample},
    store::{StoreError, Tenant, TenantStore},
};

const SETTLE_POLL: Duration = Duration::from_millis(20);
const SETTLE_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: String,
    /// Argument template; `{port}` and `{host}` are substituted per tenant.
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub public_host: String,
    pub mode: String,
    pub orchestrator_url: String,
    /// An exit inside this window counts as a failed start.
    pub confirm_window: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// How long `stop` waits for the exit before reporting `Unknown`.
    pub stop_wait: Duration,
    pub readiness_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no tenant on port {0}")]
    NotFound(u16),
    #[error("tenant process on port {0} is already running")]
    AlreadyRunning(u16),
    #[error("tenant process on port {0} is starting or stopping")]
    Busy(u16),
    #[error("failed to spawn tenant process on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("tenant process on port {port} exited during startup ({status})")]
    ExitedDuringStartup { port: u16, status: String },
    #[error("tenant process on port {0} did not accept connections in time")]
    NotReady(u16),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SupervisorError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::AlreadyRunning(_) => "already_running",
            SupervisorError::Busy(_) => "busy",
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::ExitedDuringStartup { .. } => "exited_during_startup",
            SupervisorError::NotReady(_) => "not_ready",
            SupervisorError::Store(_) => "store",
        }
    }
}

/// Lifecycle of a port's slot. A port without a slot is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Exited,
    Killed,
    /// The process had not exited when the wait ran out; the port stays reserved.
    Unknown,
    NotRunning,
}

impl StopOutcome {
    fn metric_label(self) -> &'static str {
        match self {
            StopOutcome::Exited => "exited",
            StopOutcome::Killed => "killed",
            StopOutcome::Unknown => "unknown",
            StopOutcome::NotRunning => "not_running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartOutcome {
    Restarted,
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TenantHealth {
    Healthy,
    Failed { reason: String, since: DateTime<Utc> },
}

/// Point-in-time view of a running tenant process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningProcess {
    pub tenant_id: String,
    pub name: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub work_dir: PathBuf,
    pub cpu: f32,
    pub ram: f64,
    pub cpu_history: Vec<f32>,
}

/// One row of the monitoring endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub name: String,
    pub port: u16,
    pub cpu: f32,
    pub ram: f64,
    pub cpu_history: Vec<f32>,
    pub health: TenantHealth,
}

#[derive(Debug, Clone)]
struct ExitReport {
    forced: bool,
    status: String,
}

struct TrackedProcess {
    tenant_id: String,
    name: String,
    pid: u32,
    started_at: DateTime<Utc>,
    work_dir: PathBuf,
    cpu: f32,
    ram: f64,
    history: CpuHistory,
    stop_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<ExitReport>>,
}

struct Slot {
    generation: u64,
    state: SlotState,
    process: Option<TrackedProcess>,
}

struct HealthEntry {
    name: String,
    health: TenantHealth,
}

struct SupervisorInner {
    config: SupervisorConfig,
    store: Arc<dyn TenantStore>,
    slots: DashMap<u16, Slot>,
    health: DashMap<u16, HealthEntry>,
    next_generation: AtomicU64,
}

/// Owns every tenant process. At most one slot exists per port.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, store: Arc<dyn TenantStore>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                store,
                slots: DashMap::new(),
                health: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self, port: u16) -> Option<SlotState> {
        self.inner.slots.get(&port).map(|slot| slot.state)
    }

    /// Spawns the tenant bound to `port` and returns its pid once the
    /// confirmation window passes without an exit.
    pub async fn start(&self, port: u16, work_dir: Option<PathBuf>) -> Result<u32, SupervisorError> {
        if let Some(state) = self.state(port) {
            return Err(occupied(port, state));
        }
        let tenant = self
            .inner
            .store
            .find_by_port(port)
            .await?
            .ok_or(SupervisorError::NotFound(port))?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        match self.inner.slots.entry(port) {
            Entry::Occupied(entry) => return Err(occupied(port, entry.get().state)),
            Entry::Vacant(entry) => {
                entry.insert(Slot {
                    generation,
                    state: SlotState::Starting,
                    process: None,
                });
            }
        }

        let started = Instant::now();
        let result = self.launch(&tenant, generation, work_dir).await;
        match &result {
            Ok(pid) => {
                counter!("pier_tenant_starts_total", "outcome" => "success").increment(1);
                self.inner.health.insert(
                    port,
                    HealthEntry {
                        name: tenant.name.clone(),
                        health: TenantHealth::Healthy,
                    },
                );
                info!(
                    tenant = %tenant.name,
                    port,
                    pid,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tenant process running"
                );
            }
            Err(err) => {
                counter!("pier_tenant_starts_total", "outcome" => err.metric_label()).increment(1);
                // Once a child exists its watcher owns the slot.
                self.inner.slots.remove_if(&port, |_, slot| {
                    slot.generation == generation && slot.process.is_none()
                });
                warn!(tenant = %tenant.name, port, error = %err, "tenant process failed to start");
            }
        }
        self.record_running();
        result
    }

    async fn launch(
        &self,
        tenant: &Tenant,
        generation: u64,
        work_dir: Option<PathBuf>,
    ) -> Result<u32, SupervisorError> {
        let config = &self.inner.config;
        let port = tenant.port;
        let work_dir = work_dir.unwrap_or_else(|| config.work_dir.clone());

        let mut command = Command::new(&config.command);
        command
            .args(
                config
                    .args
                    .iter()
                    .map(|arg| render_arg(arg, &config.public_host, port)),
            )
            .current_dir(&work_dir)
            .env(env::MODE, &config.mode)
            .env(env::TENANT_ID, &tenant.id)
            .env(env::TENANT_SECRET, &tenant.secret)
            .env(env::TENANT_PORT, port.to_string())
            .env(env::TENANT_DOMAIN, &tenant.domain)
            .env(env::ORCHESTRATOR_URL, &config.orchestrator_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = command
            .spawn()
            .map_err(|source| SupervisorError::Spawn { port, source })?;
        let Some(pid) = child.id() else {
            let status = child.wait().await.map(describe).unwrap_or_default();
            return Err(SupervisorError::ExitedDuringStartup { port, status });
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tenant.name.clone(), port, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tenant.name.clone(), port, true));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        if let Some(mut slot) = self.inner.slots.get_mut(&port) {
            if slot.generation == generation {
                slot.process = Some(TrackedProcess {
                    tenant_id: tenant.id.clone(),
                    name: tenant.name.clone(),
                    pid,
                    started_at: Utc::now(),
                    work_dir: work_dir.clone(),
                    cpu: 0.0,
                    ram: 0.0,
                    history: CpuHistory::default(),
                    stop_tx: Some(stop_tx),
                    exited: exit_rx.clone(),
                });
            }
        }
        tokio::spawn(watch_child(
            Arc::clone(&self.inner),
            port,
            generation,
            child,
            stop_rx,
            exit_tx,
        ));
        debug!(tenant = %tenant.name, port, pid, work_dir = %work_dir.display(), "tenant process spawned");

        if let Some(report) = wait_exit(exit_rx.clone(), config.confirm_window).await {
            return Err(SupervisorError::ExitedDuringStartup {
                port,
                status: report.status,
            });
        }

        if let Some(limit) = config.readiness_timeout {
            if !wait_listening(&config.public_host, port, limit, &exit_rx).await {
                self.begin_stop(port, generation);
                return Err(SupervisorError::NotReady(port));
            }
        }

        match self.inner.slots.get_mut(&port) {
            Some(mut slot) if slot.generation == generation => {
                slot.state = SlotState::Running;
                Ok(pid)
            }
            _ => Err(SupervisorError::ExitedDuringStartup {
                port,
                status: "exited".into(),
            }),
        }
    }

    fn begin_stop(&self, port: u16, generation: u64) {
        let stop_tx = match self.inner.slots.get_mut(&port) {
            Some(mut slot) if slot.generation == generation => {
                slot.state = SlotState::Stopping;
                slot.process.as_mut().and_then(|process| process.stop_tx.take())
            }
            _ => None,
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
    }

    /// Terminates the process on `port`. The process leaves [`Self::list`]
    /// immediately; the port stays reserved until the exit is observed.
    pub async fn stop(&self, port: u16) -> Result<StopOutcome, SupervisorError> {
        let (stop_tx, exited) = {
            let Some(mut slot) = self.inner.slots.get_mut(&port) else {
                info!(port, "stop requested for idle port; nothing to do");
                return Ok(StopOutcome::NotRunning);
            };
            if slot.state != SlotState::Running {
                return Err(SupervisorError::Busy(port));
            }
            slot.state = SlotState::Stopping;
            match slot.process.as_mut() {
                Some(process) => (process.stop_tx.take(), process.exited.clone()),
                None => return Err(SupervisorError::Busy(port)),
            }
        };
        self.record_running();

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
        let outcome = match wait_exit(exited, self.inner.config.stop_wait).await {
            Some(report) if report.forced => StopOutcome::Killed,
            Some(_) => StopOutcome::Exited,
            None => StopOutcome::Unknown,
        };
        counter!("pier_tenant_stops_total", "outcome" => outcome.metric_label()).increment(1);
        info!(port, outcome = outcome.metric_label(), "tenant process stopped");
        Ok(outcome)
    }

    /// Stop followed by start. The tenant is unreachable in between.
    pub async fn restart(&self, port: u16) -> Result<RestartOutcome, SupervisorError> {
        let work_dir = self.inner.slots.get(&port).and_then(|slot| {
            slot.process
                .as_ref()
                .map(|process| process.work_dir.clone())
        });
        match self.stop(port).await? {
            StopOutcome::NotRunning => {
                info!(port, "restart requested for idle port; nothing to do");
                return Ok(RestartOutcome::NotRunning);
            }
            StopOutcome::Unknown => return Err(SupervisorError::Busy(port)),
            StopOutcome::Exited | StopOutcome::Killed => {}
        }
        self.start(port, work_dir).await?;
        Ok(RestartOutcome::Restarted)
    }

    /// Stops every running process and returns how many were stopped.
    /// Starts still inside their confirmation window are waited out first.
    pub async fn stop_all(&self) -> usize {
        self.settle_starting().await;
        let ports: Vec<u16> = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Running)
            .map(|slot| *slot.key())
            .collect();
        let results = join_all(ports.iter().map(|port| self.stop(*port))).await;
        let stopped = results
            .iter()
            .filter(|result| {
                matches!(
                    result,
                    Ok(StopOutcome::Exited | StopOutcome::Killed | StopOutcome::Unknown)
                )
            })
            .count();
        info!(requested = ports.len(), stopped, "stopped all tenant processes");
        stopped
    }

    async fn settle_starting(&self) {
        let config = &self.inner.config;
        let deadline = Instant::now()
            + config.confirm_window
            + config.readiness_timeout.unwrap_or_default()
            + SETTLE_MARGIN;
        loop {
            let starting: Vec<u16> = self
                .inner
                .slots
                .iter()
                .filter(|slot| slot.state == SlotState::Starting)
                .map(|slot| *slot.key())
                .collect();
            if starting.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                warn!(?starting, "tenant starts still pending, leaving them running");
                return;
            }
            sleep(SETTLE_POLL).await;
        }
    }

    pub fn list(&self) -> Vec<RunningProcess> {
        let mut running: Vec<RunningProcess> = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Running)
            .filter_map(|slot| {
                slot.process.as_ref().map(|process| RunningProcess {
                    tenant_id: process.tenant_id.clone(),
                    name: process.name.clone(),
                    port: *slot.key(),
                    pid: process.pid,
                    started_at: process.started_at,
                    work_dir: process.work_dir.clone(),
                    cpu: process.cpu,
                    ram: process.ram,
                    cpu_history: process.history.to_vec(),
                })
            })
            .collect();
        running.sort_by_key(|process| process.port);
        running
    }

    /// Running processes plus tenants whose last restart failed.
    pub fn usage(&self) -> Vec<UsageReport> {
        let running = self.list();
        let mut reports: Vec<UsageReport> = running
            .iter()
            .map(|process| UsageReport {
                name: process.name.clone(),
                port: process.port,
                cpu: process.cpu,
                ram: process.ram,
                cpu_history: process.cpu_history.clone(),
                health: self.health(process.port),
            })
            .collect();
        for entry in self.inner.health.iter() {
            let port = *entry.key();
            if matches!(entry.health, TenantHealth::Failed { .. })
                && !running.iter().any(|process| process.port == port)
            {
                reports.push(UsageReport {
                    name: entry.name.clone(),
                    port,
                    cpu: 0.0,
                    ram: 0.0,
                    cpu_history: Vec::new(),
                    health: entry.health.clone(),
                });
            }
        }
        reports.sort_by_key(|report| report.port);
        reports
    }

    pub fn health(&self, port: u16) -> TenantHealth {
        self.inner
            .health
            .get(&port)
            .map(|entry| entry.health.clone())
            .unwrap_or(TenantHealth::Healthy)
    }

    fn record_running(&self) {
        let running = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Running)
            .count();
        gauge!("pier_tenant_processes_running").set(running as f64);
    }
}

#[async_trait]
impl Fleet for ProcessSupervisor {
    fn targets(&self) -> Vec<MonitorTarget> {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Running)
            .filter_map(|slot| {
                slot.process.as_ref().map(|process| MonitorTarget {
                    port: *slot.key(),
                    pid: process.pid,
                })
            })
            .collect()
    }

    fn record_sample(&self, port: u16, sample: Option<UsageSample>) {
        let Some(mut slot) = self.inner.slots.get_mut(&port) else {
            return;
        };
        let Some(process) = slot.process.as_mut() else {
            return;
        };
        match sample {
            Some(sample) => {
                process.cpu = sample.cpu;
                process.ram = sample.ram_mb;
                process.history.push(sample.cpu);
            }
            None => {
                process.cpu = 0.0;
                process.ram = 0.0;
            }
        }
    }

    async fn restart(&self, port: u16) -> Result<(), SupervisorError> {
        ProcessSupervisor::restart(self, port).await.map(|_| ())
    }

    fn mark_failed(&self, port: u16, reason: String) {
        let health = TenantHealth::Failed {
            reason,
            since: Utc::now(),
        };
        match self.inner.health.entry(port) {
            Entry::Occupied(mut entry) => entry.get_mut().health = health,
            Entry::Vacant(entry) => {
                entry.insert(HealthEntry {
                    name: port.to_string(),
                    health,
                });
            }
        }
    }
}

fn occupied(port: u16, state: SlotState) -> SupervisorError {
    if state == SlotState::Running {
        warn!(port, "tenant process already running; ignoring start");
        SupervisorError::AlreadyRunning(port)
    } else {
        SupervisorError::Busy(port)
    }
}

fn render_arg(template: &str, host: &str, port: u16) -> String {
    template
        .replace("{port}", &port.to_string())
        .replace("{host}", host)
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}

/// Resolves with the exit report if the child exits within `limit`.
async fn wait_exit(
    mut exited: watch::Receiver<Option<ExitReport>>,
    limit: Duration,
) -> Option<ExitReport> {
    let wait = async move {
        let _ = exited.wait_for(Option::is_some).await;
        let report = exited.borrow().clone();
        report
    };
    timeout(limit, wait).await.ok().flatten()
}

async fn wait_listening(
    host: &str,
    port: u16,
    limit: Duration,
    exited: &watch::Receiver<Option<ExitReport>>,
) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if exited.borrow().is_some() {
            return false;
        }
        let attempt = timeout(Duration::from_millis(250), TcpStream::connect((host, port))).await;
        if matches!(attempt, Ok(Ok(_))) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn watch_child(
    inner: Arc<SupervisorInner>,
    port: u16,
    generation: u64,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    let report = tokio::select! {
        status = child.wait() => ExitReport {
            forced: false,
            status: status.map(describe).unwrap_or_else(|err| err.to_string()),
        },
        _ = stop_rx => terminate(&mut child, inner.config.stop_grace).await,
    };

    let removed = inner
        .slots
        .remove_if(&port, |_, slot| slot.generation == generation);
    if let Some((_, slot)) = removed {
        if slot.state == SlotState::Running {
            warn!(port, status = %report.status, "tenant process exited unexpectedly");
            let running = inner
                .slots
                .iter()
                .filter(|slot| slot.state == SlotState::Running)
                .count();
            gauge!("pier_tenant_processes_running").set(running as f64);
        } else {
            debug!(port, status = %report.status, forced = report.forced, "tenant process exited");
        }
    }
    exit_tx.send_replace(Some(report));
}

async fn terminate(child: &mut Child, grace: Duration) -> ExitReport {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(status) = timeout(grace, child.wait()).await {
                        return ExitReport {
                            forced: false,
                            status: status.map(describe).unwrap_or_else(|err| err.to_string()),
                        };
                    }
                    warn!(
                        pid,
                        grace_ms = grace.as_millis() as u64,
                        "tenant process ignored SIGTERM; killing"
                    );
                }
                Err(err) => warn!(pid, error = %err, "failed to send SIGTERM; killing"),
            }
        }
    }

    // Windows has no graceful signal for console processes; take the whole tree down.
    #[cfg(windows)]
    {
        let _ = grace;
        if let Some(pid) = child.id() {
            let killed = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .status()
                .await;
            if let Err(err) = killed {
                warn!(pid, error = %err, "taskkill failed");
            }
        }
    }

    if let Err(err) = child.start_kill() {
        debug!(error = %err, "kill after termination request failed");
    }
    ExitReport {
        forced: true,
        status: child
            .wait()
            .await
            .map(describe)
            .unwrap_or_else(|err| err.to_string()),
    }
}

async fn pump_lines<R>(reader: R, tenant: String, port: u16, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if stderr => warn!(tenant = %tenant, port, "{line}"),
            Ok(Some(line)) => info!(tenant = %tenant, port, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(tenant = %tenant, port, error = %err, "tenant output closed");
                break;
            }
        }
    }
}
