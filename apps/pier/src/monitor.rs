use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::supervisor::SupervisorError;

pub const CPU_HISTORY_CAPACITY: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageSample {
    /// Percent of one core; can exceed 100 on multi-core hosts.
    pub cpu: f32,
    /// Resident memory in MiB.
    pub ram_mb: f64,
}

/// Fixed-capacity CPU history; the oldest sample is evicted on overflow.
#[derive(Debug, Clone, Default)]
pub struct CpuHistory {
    samples: VecDeque<f32>,
}

impl CpuHistory {
    pub fn push(&mut self, cpu: f32) {
        if self.samples.len() == CPU_HISTORY_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(cpu);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTarget {
    pub port: u16,
    pub pid: u32,
}

/// The set of processes the monitor watches and can act on.
#[async_trait]
pub trait Fleet: Send + Sync {
    fn targets(&self) -> Vec<MonitorTarget>;
    /// `None` means the process could not be sampled.
    fn record_sample(&self, port: u16, sample: Option<UsageSample>);
    async fn restart(&self, port: u16) -> Result<(), SupervisorError>;
    fn mark_failed(&self, port: u16, reason: String);
}

#[async_trait]
pub trait ProcessSampler: Send + Sync {
    async fn sample(&self, pids: &[u32]) -> HashMap<u32, UsageSample>;
}

/// Samples through `sysinfo`. CPU usage is a delta between refreshes, so the
/// first sample of a pid reads as zero.
#[derive(Clone)]
pub struct SysinfoSampler {
    system: Arc<Mutex<System>>,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new_with_specifics(RefreshKind::nothing()))),
        }
    }
}

#[async_trait]
impl ProcessSampler for SysinfoSampler {
    async fn sample(&self, pids: &[u32]) -> HashMap<u32, UsageSample> {
        if pids.is_empty() {
            return HashMap::new();
        }
        let system = Arc::clone(&self.system);
        let pids: Vec<u32> = pids.to_vec();
        let join = tokio::task::spawn_blocking(move || {
            let mut system = system.lock();
            let wanted: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&wanted),
                true,
                ProcessRefreshKind::nothing().with_cpu().with_memory(),
            );
            pids.into_iter()
                .filter_map(|pid| {
                    system.process(Pid::from_u32(pid)).map(|process| {
                        (
                            pid,
                            UsageSample {
                                cpu: process.cpu_usage(),
                                ram_mb: process.memory() as f64 / (1024.0 * 1024.0),
                            },
                        )
                    })
                })
                .collect::<HashMap<_, _>>()
        });

        match join.await {
            Ok(samples) => samples,
            Err(err) => {
                warn!(error = %err, "process sampling task failed");
                HashMap::new()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// CPU percent above which a process is restarted.
    pub cpu_threshold: f32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            cpu_threshold: 60.0,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub sampled: usize,
    pub missing: usize,
    pub restarted: Vec<u16>,
}

pub struct ResourceMonitor {
    fleet: Arc<dyn Fleet>,
    sampler: Arc<dyn ProcessSampler>,
    config: MonitorConfig,
}

impl ResourceMonitor {
    pub fn new(fleet: Arc<dyn Fleet>, sampler: Arc<dyn ProcessSampler>, config: MonitorConfig) -> Self {
        Self {
            fleet,
            sampler,
            config,
        }
    }

    /// Samples every target once and restarts the ones over the threshold.
    pub async fn tick(&self) -> TickReport {
        let started = Instant::now();
        let targets = self.fleet.targets();
        let pids: Vec<u32> = targets.iter().map(|target| target.pid).collect();
        let samples = self.sampler.sample(&pids).await;

        let mut report = TickReport::default();
        for target in targets {
            let sample = samples.get(&target.pid).copied();
            self.fleet.record_sample(target.port, sample);

            let Some(sample) = sample else {
                debug!(port = target.port, pid = target.pid, "process not sampled; usage zeroed");
                report.missing += 1;
                continue;
            };
            report.sampled += 1;

            if sample.cpu > self.config.cpu_threshold {
                warn!(
                    port = target.port,
                    pid = target.pid,
                    cpu = sample.cpu,
                    threshold = self.config.cpu_threshold,
                    "cpu above threshold; restarting tenant process"
                );
                counter!("pier_monitor_restarts_total").increment(1);
                report.restarted.push(target.port);
                if let Err(err) = self.fleet.restart(target.port).await {
                    error!(port = target.port, error = %err, "monitor restart failed");
                    self.fleet.mark_failed(target.port, err.to_string());
                }
            }
        }

        histogram!("pier_monitor_tick_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        report
    }

    /// Runs [`Self::tick`] forever on the configured interval. Ticks never overlap.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                threshold = self.config.cpu_threshold,
                "resource monitor started"
            );
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}
