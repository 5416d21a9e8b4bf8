//! Alert delivery over SMTP
//!
//! A [`Mailer`] turns a [`MailerRequest`] into one SMTP transaction. Every
//! call opens a fresh connection, negotiates the configured
//! [`SecurityMode`], optionally authenticates, submits the message and
//! drops the connection again, whatever the outcome.

mod message;
mod smtp;
mod transport;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use message::compose;
pub use smtp::SmtpError;
pub use transport::{
    BoxedStream, Dialer, RustlsUpgrader, SmtpMailer, SmtpStream, TcpDialer, TlsUpgrader,
};

/// Sender used when no SMTP user is configured.
pub const PLACEHOLDER_SENDER: &str = "no-reply@localhost";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct MailerRequest {
    pub recipients: Vec<Recipient>,
    pub subject: String,
    pub body_html: String,
}

#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    /// Delivers `request` to all of its recipients. Not retried.
    async fn send(&self, request: MailerRequest) -> Result<(), MailError>;

    /// Checks that the SMTP server is reachable and speaks SMTP under the
    /// configured security mode.
    async fn health(&self) -> Result<(), MailError>;
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Plain TCP. Never authenticates.
    None,
    /// Plain TCP upgraded in-band with `STARTTLS` (usually port 587).
    StartTls,
    /// TLS from the first byte, historically "SSL" (usually port 465).
    ImplicitTls,
}

impl SecurityMode {
    /// Whether credentials, if configured, are sent in this mode.
    pub fn authenticates(self) -> bool {
        match self {
            SecurityMode::None => false,
            SecurityMode::StartTls | SecurityMode::ImplicitTls => true,
        }
    }
}

/// Parses the configuration spelling: `""`, `"tls"` or `"ssl"`, any case.
impl FromStr for SecurityMode {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" => Ok(SecurityMode::None),
            "tls" => Ok(SecurityMode::StartTls),
            "ssl" => Ok(SecurityMode::ImplicitTls),
            _ => Err(MailError::UnsupportedSecurityMode(s.to_string())),
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::None => write!(f, "none"),
            SecurityMode::StartTls => write!(f, "starttls"),
            SecurityMode::ImplicitTls => write!(f, "implicit-tls"),
        }
    }
}

/// SMTP endpoint settings, fixed for the lifetime of the agent.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Raw security mode as configured, see [`SecurityMode`].
    pub security: String,
    /// Upper bound for one whole SMTP exchange.
    pub timeout: Duration,
    /// Skip certificate chain verification on TLS connections.
    pub accept_invalid_certs: bool,
    pub helo_name: String,
}

impl TransportConfig {
    pub fn security_mode(&self) -> Result<SecurityMode, MailError> {
        self.security.parse()
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }

    pub fn sender(&self) -> &str {
        if self.username.is_empty() {
            PLACEHOLDER_SENDER
        } else {
            &self.username
        }
    }

    pub fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Phase of an SMTP exchange, used to tell where a send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    TlsConnect,
    Authenticate,
    Send,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Connect => write!(f, "connect"),
            Stage::TlsConnect => write!(f, "TLS connect"),
            Stage::Authenticate => write!(f, "authenticate"),
            Stage::Send => write!(f, "send"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("unsupported SMTP security mode '{0}', expected \"\", \"tls\" or \"ssl\"")]
    UnsupportedSecurityMode(String),
    #[error("no recipients to deliver to")]
    NoRecipients,
    #[error("SMTP {stage} failed for {server}")]
    Transport {
        stage: Stage,
        server: String,
        #[source]
        source: SmtpError,
    },
    #[error("SMTP {stage} timed out for {server} after {after:?}")]
    Timeout {
        stage: Stage,
        server: String,
        after: Duration,
    },
}

impl MailError {
    /// The stage that failed, for errors raised after configuration checks.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            MailError::Transport { stage, .. } | MailError::Timeout { stage, .. } => Some(*stage),
            MailError::UnsupportedSecurityMode(_) | MailError::NoRecipients => None,
        }
    }
}
