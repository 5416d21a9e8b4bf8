//! Process information collector (reads /proc on Linux)

mod linux;

pub use linux::LinuxProcessCollector;

/// One process observation for a single sampling cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("failed to enumerate processes")]
    Enumerate(#[source] std::io::Error),
    #[error("failed to read process {pid}")]
    Read {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed stat for process {pid}")]
    Malformed { pid: u32 },
    #[error("process {pid} was not primed in this cycle")]
    NotPrimed { pid: u32 },
    #[error("process {pid} was replaced since priming")]
    Replaced { pid: u32 },
}

/// CPU utilization is a delta between two points in time, so a cycle is
/// `enumerate`, `prime` every pid, wait, then `sample` every pid.
pub trait ProcessCollector: Send + Sync {
    /// Lists the pids currently running. Failing here leaves the agent blind.
    fn enumerate(&self) -> Result<Vec<u32>, CollectorError>;

    /// Records the CPU baseline for `pid`.
    fn prime(&self, pid: u32) -> Result<(), CollectorError>;

    /// Reads utilization since the baseline set by [`ProcessCollector::prime`].
    /// The baseline is consumed.
    fn sample(&self, pid: u32) -> Result<ProcessSample, CollectorError>;

    /// Drops any baselines left over from a cycle.
    fn reset(&self);
}
