//! Periodic monitoring task

use crate::sample::{MonitorSample, Reading};
use async_trait::async_trait;
use obd_protocol::{timestamp_ms, PidValue};
use parking_lot::Mutex;
use ring_buffer::{BufferError, RingBuffer, DEFAULT_CAPACITY};
use safety_validator::SafetyMonitor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Error from a single PID query
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Something that can read one live PID
#[async_trait]
pub trait PidSource: Send + Sync {
    async fn sample(&self, pid: u8) -> Result<PidValue, SourceError>;
}

/// Errors starting a monitor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("Monitoring needs at least one PID")]
    EmptyPidSet,

    #[error("Monitoring interval must be non-zero")]
    ZeroInterval,

    #[error("History buffer: {0}")]
    Buffer(#[from] BufferError),
}

/// Monitoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between round starts
    pub interval_ms: u64,
    /// Samples kept in history
    pub history_capacity: usize,
    /// Consecutive failures of one PID before a warning is logged
    pub failure_warn_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            history_capacity: DEFAULT_CAPACITY,
            failure_warn_threshold: 5,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Live readings fed through cut/resume hysteresis, keyed by PID
pub struct SafetyBinding {
    pub monitor: SafetyMonitor,
    /// PID -> limit name
    pub limits: BTreeMap<u8, String>,
}

struct Shared {
    history: RingBuffer<MonitorSample>,
    failures: Mutex<BTreeMap<u8, u32>>,
    rounds: AtomicU64,
}

/// Running monitor. Dropping the handle also stops the task.
pub struct MonitorHandle {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    pids: Vec<u8>,
    interval: Duration,
}

/// Spawn the monitoring task on the current runtime
pub fn start_monitor(
    source: Arc<dyn PidSource>,
    pids: Vec<u8>,
    config: MonitorConfig,
    safety: Option<SafetyBinding>,
) -> Result<MonitorHandle, MonitorError> {
    if pids.is_empty() {
        return Err(MonitorError::EmptyPidSet);
    }
    if config.interval_ms == 0 {
        return Err(MonitorError::ZeroInterval);
    }

    let shared = Arc::new(Shared {
        history: RingBuffer::new(config.history_capacity)?,
        failures: Mutex::new(pids.iter().map(|&pid| (pid, 0)).collect()),
        rounds: AtomicU64::new(0),
    });
    let (stop, stop_rx) = watch::channel(false);
    let interval = config.interval();

    info!(
        "Starting monitor for {} PIDs every {}ms",
        pids.len(),
        config.interval_ms
    );
    let task = tokio::spawn(run(
        source,
        pids.clone(),
        interval,
        config.failure_warn_threshold,
        safety,
        shared.clone(),
        stop_rx,
    ));

    Ok(MonitorHandle {
        shared,
        stop,
        task: Some(task),
        pids,
        interval,
    })
}

async fn run(
    source: Arc<dyn PidSource>,
    pids: Vec<u8>,
    interval: Duration,
    warn_threshold: u32,
    mut safety: Option<SafetyBinding>,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut round = 0u64;

    'rounds: loop {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            _ = ticker.tick() => {}
        }

        let mut readings = Vec::with_capacity(pids.len());
        for &pid in &pids {
            if *stop.borrow() {
                break 'rounds;
            }
            let value = match source.sample(pid).await {
                Ok(value) => {
                    shared.failures.lock().insert(pid, 0);
                    Some(value)
                }
                Err(e) => {
                    let mut failures = shared.failures.lock();
                    let count = failures.entry(pid).or_insert(0);
                    *count += 1;
                    if *count == warn_threshold {
                        warn!("PID {:02X} failed {} rounds in a row: {}", pid, count, e);
                    } else {
                        debug!("PID {:02X} query failed: {}", pid, e);
                    }
                    None
                }
            };
            readings.push(Reading { pid, value });
        }

        let mut safety_events = Vec::new();
        if let Some(binding) = safety.as_mut() {
            for reading in &readings {
                let (Some(value), Some(limit)) = (&reading.value, binding.limits.get(&reading.pid))
                else {
                    continue;
                };
                if let Some(event) = binding.monitor.observe(limit, value.value) {
                    safety_events.push(event);
                }
            }
        }

        shared.history.push(MonitorSample {
            timestamp_ms: timestamp_ms(),
            round,
            readings,
            safety_events,
        });
        round += 1;
        shared.rounds.store(round, Ordering::Relaxed);
    }

    info!("Monitor stopped after {} rounds", round);
}

impl MonitorHandle {
    /// Stop the task and wait for it. History stays readable.
    pub async fn stop(&mut self) {
        self.stop.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Monitor task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn latest(&self) -> Option<MonitorSample> {
        self.shared.history.latest()
    }

    /// Last `count` samples, most recent first
    pub fn history(&self, count: usize) -> Vec<MonitorSample> {
        self.shared.history.read_last(count)
    }

    /// Samples from the last `duration_ms`, most recent first
    pub fn window(&self, duration_ms: u64) -> Vec<MonitorSample> {
        self.shared.history.read_window(duration_ms, timestamp_ms())
    }

    /// Consecutive failure count per PID
    pub fn failure_counts(&self) -> BTreeMap<u8, u32> {
        self.shared.failures.lock().clone()
    }

    /// Completed rounds
    pub fn rounds(&self) -> u64 {
        self.shared.rounds.load(Ordering::Relaxed)
    }

    pub fn pids(&self) -> &[u8] {
        &self.pids
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
