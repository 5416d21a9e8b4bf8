//! Sampling loop: enumerate, measure, evaluate, alert

use crate::collector::{CollectorError, ProcessCollector, ProcessSample};
use crate::detector::{evaluate, AlertBatch};
use crate::notifier::{Mailer, MailerRequest, Recipient};
use crate::report::{render_html, ALERT_SUBJECT};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No process crossed the threshold.
    Quiet { sampled: usize },
    /// `delivered` is false when mail is disabled or the send failed.
    Alerted { processes: usize, delivered: bool },
    /// Stopped during the measurement wait.
    Cancelled,
}

pub struct Monitor {
    collector: Arc<dyn ProcessCollector>,
    mailer: Option<Arc<dyn Mailer>>,
    recipients: Vec<Recipient>,
    interval: Duration,
}

impl Monitor {
    pub fn new(collector: Arc<dyn ProcessCollector>, interval: Duration) -> Self {
        Self {
            collector,
            mailer: None,
            recipients: Vec::new(),
            interval,
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>, recipients: Vec<Recipient>) -> Self {
        self.mailer = Some(mailer);
        self.recipients = recipients;
        self
    }

    /// Runs cycles back to back until `cancel` fires. Only a failure to
    /// enumerate processes ends the loop early.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CollectorError> {
        info!(
            interval_secs = self.interval.as_secs(),
            mail = self.mailer.is_some(),
            "Monitoring loop started"
        );
        while !cancel.is_cancelled() {
            self.run_cycle(&cancel).await?;
        }
        info!("Monitoring loop stopped");
        Ok(())
    }

    pub async fn run_cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CollectorError> {
        info!("Sampling processes");
        let pids = self.collector.enumerate()?;

        let primed: Vec<u32> = pids
            .into_iter()
            .filter(|&pid| match self.collector.prime(pid) {
                Ok(()) => true,
                Err(e) => {
                    debug!(pid, "Skipping process: {e}");
                    false
                }
            })
            .collect();

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.interval) => false,
            _ = cancel.cancelled() => true,
        };
        if cancelled {
            self.collector.reset();
            return Ok(CycleOutcome::Cancelled);
        }

        let samples = self.read_samples(&primed);
        self.collector.reset();

        let sampled = samples.len();
        let Some(batch) = evaluate(samples) else {
            debug!(sampled, "No process above CPU threshold");
            return Ok(CycleOutcome::Quiet { sampled });
        };

        let top = &batch.samples()[0];
        warn!(
            processes = batch.len(),
            top_pid = top.pid,
            top_name = %top.name,
            top_cpu = %format!("{:.2}", top.cpu_percent),
            "High CPU usage detected"
        );
        let delivered = self.dispatch(&batch).await;
        Ok(CycleOutcome::Alerted {
            processes: batch.len(),
            delivered,
        })
    }

    fn read_samples(&self, pids: &[u32]) -> Vec<ProcessSample> {
        pids.iter()
            .filter_map(|&pid| match self.collector.sample(pid) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    debug!(pid, "Skipping process: {e}");
                    None
                }
            })
            .collect()
    }

    async fn dispatch(&self, batch: &AlertBatch) -> bool {
        let Some(mailer) = &self.mailer else {
            info!("Mail notifier disabled, alert not sent");
            return false;
        };

        let request = MailerRequest {
            recipients: self.recipients.clone(),
            subject: ALERT_SUBJECT.to_string(),
            body_html: render_html(batch),
        };
        match mailer.send(request).await {
            Ok(()) => {
                info!(recipients = self.recipients.len(), "Alert email sent");
                true
            }
            Err(e) => {
                error!("Failed to send alert email: {:#}", anyhow::Error::new(e));
                false
            }
        }
    }
}
