//! High CPU detection

use crate::collector::ProcessSample;

/// A process qualifies when its CPU usage is strictly above this.
pub const CPU_THRESHOLD_PERCENT: f64 = 60.0;

/// Maximum number of processes reported in one alert.
pub const MAX_ALERT_ENTRIES: usize = 10;

/// Offending processes for one cycle, highest CPU first. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertBatch {
    samples: Vec<ProcessSample>,
}

impl AlertBatch {
    pub fn samples(&self) -> &[ProcessSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<ProcessSample> {
        self.samples
    }
}

/// Keeps samples above [`CPU_THRESHOLD_PERCENT`], sorts them by CPU
/// descending (stable, so ties keep enumeration order) and keeps the first
/// [`MAX_ALERT_ENTRIES`]. Returns `None` when nothing qualifies.
pub fn evaluate(samples: Vec<ProcessSample>) -> Option<AlertBatch> {
    let mut hot: Vec<ProcessSample> = samples
        .into_iter()
        .filter(|s| s.cpu_percent > CPU_THRESHOLD_PERCENT)
        .collect();
    if hot.is_empty() {
        return None;
    }

    hot.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
    hot.truncate(MAX_ALERT_ENTRIES);
    Some(AlertBatch { samples: hot })
}
