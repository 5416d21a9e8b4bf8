//! Integration tests for the sampling loop

use hogwatch_daemon::{
    collector::{CollectorError, ProcessCollector, ProcessSample},
    monitor::{CycleOutcome, Monitor, DEFAULT_SAMPLE_INTERVAL},
    notifier::{MailError, Mailer, MailerRequest, Recipient, SmtpError, Stage},
};
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeCollector {
    processes: Vec<ProcessSample>,
    fail_enumerate: bool,
    fail_prime: Vec<u32>,
    fail_sample: Vec<u32>,
    primed: Mutex<HashSet<u32>>,
    enumerations: Mutex<usize>,
    sampled: Mutex<Vec<u32>>,
    first_prime: Mutex<Option<Instant>>,
    first_sample: Mutex<Option<Instant>>,
}

impl FakeCollector {
    fn with_cpu(cpus: &[f64]) -> Self {
        let processes = cpus
            .iter()
            .enumerate()
            .map(|(i, &cpu)| ProcessSample {
                pid: 100 + i as u32,
                name: format!("worker-{i}"),
                cpu_percent: cpu,
                memory_percent: 12.3,
            })
            .collect();
        Self {
            processes,
            ..Default::default()
        }
    }

    fn enumerations(&self) -> usize {
        *self.enumerations.lock().unwrap()
    }
}

fn gone(pid: u32) -> CollectorError {
    CollectorError::Read {
        pid,
        source: io::Error::new(io::ErrorKind::NotFound, "exited"),
    }
}

impl ProcessCollector for FakeCollector {
    fn enumerate(&self) -> Result<Vec<u32>, CollectorError> {
        *self.enumerations.lock().unwrap() += 1;
        if self.fail_enumerate {
            return Err(CollectorError::Enumerate(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "no /proc",
            )));
        }
        Ok(self.processes.iter().map(|p| p.pid).collect())
    }

    fn prime(&self, pid: u32) -> Result<(), CollectorError> {
        self.first_prime.lock().unwrap().get_or_insert_with(Instant::now);
        if self.fail_prime.contains(&pid) {
            return Err(gone(pid));
        }
        self.primed.lock().unwrap().insert(pid);
        Ok(())
    }

    fn sample(&self, pid: u32) -> Result<ProcessSample, CollectorError> {
        self.first_sample.lock().unwrap().get_or_insert_with(Instant::now);
        if !self.primed.lock().unwrap().remove(&pid) {
            return Err(CollectorError::NotPrimed { pid });
        }
        self.sampled.lock().unwrap().push(pid);
        if self.fail_sample.contains(&pid) {
            return Err(gone(pid));
        }
        Ok(self
            .processes
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
            .unwrap())
    }

    fn reset(&self) {
        self.primed.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct RecordingMailer {
    fail: bool,
    requests: Mutex<Vec<MailerRequest>>,
}

impl RecordingMailer {
    fn requests(&self) -> Vec<MailerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, request: MailerRequest) -> Result<(), MailError> {
        self.requests.lock().unwrap().push(request);
        if self.fail {
            return Err(MailError::Transport {
                stage: Stage::Send,
                server: "mail.example.com:25".to_string(),
                source: SmtpError::Closed,
            });
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), MailError> {
        Ok(())
    }
}

fn recipients() -> Vec<Recipient> {
    vec![Recipient {
        name: "Ops".to_string(),
        email: "ops@example.com".to_string(),
    }]
}

fn monitor(collector: &Arc<FakeCollector>, mailer: &Arc<RecordingMailer>) -> Monitor {
    Monitor::new(collector.clone(), DEFAULT_SAMPLE_INTERVAL)
        .with_mailer(mailer.clone(), recipients())
}

fn rows(html: &str) -> usize {
    html.matches("<tr><td>").count()
}

#[tokio::test(start_paused = true)]
async fn test_mixed_load_alerts_on_hot_processes() {
    let collector = Arc::new(FakeCollector::with_cpu(&[90.5, 45.0, 75.25]));
    let mailer = Arc::new(RecordingMailer::default());

    let outcome = monitor(&collector, &mailer)
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Alerted {
            processes: 2,
            delivered: true
        }
    );
    let requests = mailer.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.subject, "High CPU Usage Alert");
    assert_eq!(request.recipients, recipients());

    let html = &request.body_html;
    assert_eq!(rows(html), 2);
    assert!(html.contains("<tr><td>100</td><td>worker-0</td><td>90.50%</td><td>12.30%</td></tr>"));
    assert!(html.contains("<tr><td>102</td><td>worker-2</td><td>75.25%</td><td>12.30%</td></tr>"));
    assert!(html.find("90.50%").unwrap() < html.find("75.25%").unwrap());
    assert!(!html.contains("45.00%"));
}

#[tokio::test(start_paused = true)]
async fn test_alert_is_capped_at_ten_highest() {
    let cpus: Vec<f64> = (0..12).map(|i| 61.0 + i as f64 * 3.0).collect();
    let collector = Arc::new(FakeCollector::with_cpu(&cpus));
    let mailer = Arc::new(RecordingMailer::default());

    let outcome = monitor(&collector, &mailer)
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Alerted {
            processes: 10,
            delivered: true
        }
    );
    let html = &mailer.requests()[0].body_html;
    assert_eq!(rows(html), 10);
    // the two coolest (61% and 64%) are dropped
    assert!(!html.contains("<td>100</td>"));
    assert!(!html.contains("<td>101</td>"));
    assert!(html.contains("<td>111</td>"));
}

#[tokio::test(start_paused = true)]
async fn test_quiet_cycle_sends_nothing() {
    let collector = Arc::new(FakeCollector::with_cpu(&[60.0, 12.5, 0.0]));
    let mailer = Arc::new(RecordingMailer::default());

    let outcome = monitor(&collector, &mailer)
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, CycleOutcome::Quiet { sampled: 3 });
    assert!(mailer.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_measurement_spans_the_interval() {
    let collector = Arc::new(FakeCollector::with_cpu(&[10.0, 20.0]));
    let mailer = Arc::new(RecordingMailer::default());

    monitor(&collector, &mailer)
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    let primed_at = collector.first_prime.lock().unwrap().unwrap();
    let sampled_at = collector.first_sample.lock().unwrap().unwrap();
    assert!(sampled_at - primed_at >= DEFAULT_SAMPLE_INTERVAL);
    assert_eq!(*collector.sampled.lock().unwrap(), vec![100, 101]);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_processes_are_skipped() {
    let mut collector = FakeCollector::with_cpu(&[95.0, 99.0, 98.0, 70.0]);
    collector.fail_prime = vec![101];
    collector.fail_sample = vec![102];
    let collector = Arc::new(collector);
    let mailer = Arc::new(RecordingMailer::default());

    let outcome = monitor(&collector, &mailer)
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Alerted {
            processes: 2,
            delivered: true
        }
    );
    // a process that failed to prime is not read again
    assert_eq!(*collector.sampled.lock().unwrap(), vec![100, 102, 103]);
    let html = &mailer.requests()[0].body_html;
    assert!(html.contains("<td>100</td>"));
    assert!(html.contains("<td>103</td>"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_does_not_abort_cycle() {
    let collector = Arc::new(FakeCollector::with_cpu(&[80.0]));
    let mailer = Arc::new(RecordingMailer {
        fail: true,
        ..Default::default()
    });

    let outcome = monitor(&collector, &mailer)
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Alerted {
            processes: 1,
            delivered: false
        }
    );
    assert_eq!(mailer.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_alert_without_mailer_is_only_logged() {
    let collector = Arc::new(FakeCollector::with_cpu(&[80.0]));
    let monitor = Monitor::new(collector.clone(), DEFAULT_SAMPLE_INTERVAL);

    let outcome = monitor.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Alerted {
            processes: 1,
            delivered: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_enumeration_failure_stops_the_loop() {
    let collector = Arc::new(FakeCollector {
        fail_enumerate: true,
        ..Default::default()
    });
    let mailer = Arc::new(RecordingMailer::default());

    let err = monitor(&collector, &mailer)
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CollectorError::Enumerate(_)));
    assert_eq!(collector.enumerations(), 1);
    assert!(mailer.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_runs_no_cycle() {
    let collector = Arc::new(FakeCollector::with_cpu(&[99.0]));
    let mailer = Arc::new(RecordingMailer::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    monitor(&collector, &mailer).run(cancel).await.unwrap();

    assert_eq!(collector.enumerations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_wait_skips_reads() {
    let collector = Arc::new(FakeCollector::with_cpu(&[99.0]));
    let mailer = Arc::new(RecordingMailer::default());
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let outcome = monitor(&collector, &mailer).run_cycle(&cancel).await.unwrap();

    assert_eq!(outcome, CycleOutcome::Cancelled);
    assert!(started.elapsed() < DEFAULT_SAMPLE_INTERVAL);
    assert!(collector.sampled.lock().unwrap().is_empty());
    assert!(collector.primed.lock().unwrap().is_empty());
    assert!(mailer.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_loop_alerts_every_cycle_until_cancelled() {
    let collector = Arc::new(FakeCollector::with_cpu(&[99.0]));
    let mailer = Arc::new(RecordingMailer::default());
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(25)).await;
        canceller.cancel();
    });

    monitor(&collector, &mailer).run(cancel).await.unwrap();

    // cycles start at 0s, 10s and 20s; the third is cut short at 25s
    assert_eq!(collector.enumerations(), 3);
    assert_eq!(mailer.requests().len(), 2);
}
