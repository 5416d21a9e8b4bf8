use anyhow::{Context, Result};
use clap::Parser;
use hogwatch_daemon::{
    collector::LinuxProcessCollector,
    config::Config,
    monitor::Monitor,
    notifier::{Mailer, SmtpMailer},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Mails an alert when processes keep the CPU busy")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Check the SMTP server once and exit
    #[arg(long)]
    check_mail: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("hogwatch daemon starting...");

    let config_path = cli.config.unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| {
            format!(
                "Cannot start without a configuration ({})",
                config_path.display()
            )
        })?;
    config.validate()?;
    info!("Configuration loaded from {}", config_path.display());

    let mail = &config.notifiers.mail;
    let mailer = mail
        .enabled
        .then(|| Arc::new(SmtpMailer::new(mail.transport())));

    if cli.check_mail {
        let mailer = mailer.context("Mail notifier is disabled")?;
        mailer.health().await.context("SMTP health check failed")?;
        info!("SMTP server {} is healthy", mailer.config().server());
        return Ok(());
    }

    let collector = Arc::new(LinuxProcessCollector::new());
    let mut monitor = Monitor::new(collector, config.sample_interval());
    match mailer {
        Some(mailer) => monitor = monitor.with_mailer(mailer, mail.recipients()),
        None => warn!("Mail notifier disabled, alerts will only be logged"),
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    monitor
        .run(cancel)
        .await
        .context("Process monitoring failed")?;
    info!("hogwatch daemon stopped");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    info!("Received shutdown signal");
    cancel.cancel();
}
