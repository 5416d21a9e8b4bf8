use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::message::compose;
use super::smtp::{Reply, SmtpClient, SmtpError};
use super::{MailError, Mailer, MailerRequest, SecurityMode, Stage, TransportConfig};

pub trait SmtpStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SmtpStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn SmtpStream>;

/// Opens the byte stream an SMTP session runs on.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Wraps an established stream in TLS. With `verify_chain` unset the
/// server certificate is accepted without checking it against any root.
#[async_trait::async_trait]
pub trait TlsUpgrader: Send + Sync {
    async fn upgrade(
        &self,
        stream: BoxedStream,
        server_name: &str,
        verify_chain: bool,
    ) -> Result<BoxedStream, SmtpError>;
}

pub struct RustlsUpgrader;

impl RustlsUpgrader {
    fn client_config(verify_chain: bool) -> Result<Arc<ClientConfig>, SmtpError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let config = if verify_chain {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth()
        };
        Ok(Arc::new(config))
    }
}

#[async_trait::async_trait]
impl TlsUpgrader for RustlsUpgrader {
    async fn upgrade(
        &self,
        stream: BoxedStream,
        server_name: &str,
        verify_chain: bool,
    ) -> Result<BoxedStream, SmtpError> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| SmtpError::InvalidServerName(server_name.to_owned()))?;
        let connector = TlsConnector::from(Self::client_config(verify_chain)?);
        let stream = connector.connect(name, stream).await?;
        Ok(Box::new(stream))
    }
}

/// Certificate chain and name checks are skipped; handshake signatures are
/// still verified.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// One deadline shared by all stages of an exchange.
struct Deadline {
    at: Instant,
    budget: Duration,
    server: String,
}

impl Deadline {
    fn start(config: &TransportConfig) -> Self {
        Self {
            at: Instant::now() + config.timeout,
            budget: config.timeout,
            server: config.server(),
        }
    }

    async fn bound<T, F>(&self, stage: Stage, fut: F) -> Result<T, MailError>
    where
        F: Future<Output = Result<T, SmtpError>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(MailError::Transport {
                stage,
                server: self.server.clone(),
                source,
            }),
            Err(_) => Err(MailError::Timeout {
                stage,
                server: self.server.clone(),
                after: self.budget,
            }),
        }
    }
}

type Session = SmtpClient<BoxedStream>;

/// Both TLS modes check the chain against the webpki roots unless the
/// operator opted out for a self-signed or pinned server.
fn verifies_chain(config: &TransportConfig, mode: SecurityMode) -> bool {
    match mode {
        SecurityMode::StartTls | SecurityMode::ImplicitTls => !config.accept_invalid_certs,
        SecurityMode::None => false,
    }
}

/// [`Mailer`] speaking SMTP to the configured server. A new connection is
/// made for every call and dropped before returning.
pub struct SmtpMailer {
    config: TransportConfig,
    dialer: Arc<dyn Dialer>,
    tls: Arc<dyn TlsUpgrader>,
}

impl SmtpMailer {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_parts(config, TcpDialer, RustlsUpgrader)
    }

    pub fn with_parts(
        config: TransportConfig,
        dialer: impl Dialer + 'static,
        tls: impl TlsUpgrader + 'static,
    ) -> Self {
        if let Ok(mode) = config.security_mode() {
            if mode != SecurityMode::None && !verifies_chain(&config, mode) {
                warn!(
                    host = %config.host,
                    %mode,
                    "SMTP server certificate chain will not be verified"
                );
            }
        }
        Self {
            config,
            dialer: Arc::new(dialer),
            tls: Arc::new(tls),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn dial(&self) -> Result<BoxedStream, SmtpError> {
        Ok(self
            .dialer
            .dial(&self.config.host, self.config.port)
            .await?)
    }

    async fn greet(&self, session: &mut Session) -> Result<Reply, SmtpError> {
        session.greeting().await?;
        session.ehlo(&self.config.helo_name).await
    }

    async fn connect(&self, mode: SecurityMode, deadline: &Deadline) -> Result<Session, MailError> {
        match mode {
            SecurityMode::None => self.connect_plain(deadline).await,
            SecurityMode::StartTls => self.connect_starttls(deadline).await,
            SecurityMode::ImplicitTls => self.connect_implicit_tls(deadline).await,
        }
    }

    /// Dials and greets in the clear, returning the EHLO reply.
    async fn open(&self, deadline: &Deadline) -> Result<(Session, Reply), MailError> {
        let stream = deadline.bound(Stage::Connect, self.dial()).await?;
        let mut session = SmtpClient::new(stream);
        let ehlo = deadline
            .bound(Stage::Connect, self.greet(&mut session))
            .await?;
        Ok((session, ehlo))
    }

    async fn connect_plain(&self, deadline: &Deadline) -> Result<Session, MailError> {
        let (session, _) = self.open(deadline).await?;
        Ok(session)
    }

    async fn connect_starttls(&self, deadline: &Deadline) -> Result<Session, MailError> {
        let (mut session, ehlo) = self.open(deadline).await?;

        let host = self.config.host.as_str();
        let upgraded = deadline
            .bound(Stage::TlsConnect, async {
                if !ehlo.has_extension("STARTTLS") {
                    return Err(SmtpError::StartTlsUnsupported);
                }
                session.starttls().await?;
                let verify = verifies_chain(&self.config, SecurityMode::StartTls);
                self.tls.upgrade(session.into_inner(), host, verify).await
            })
            .await?;

        let mut session = SmtpClient::new(upgraded);
        deadline
            .bound(Stage::TlsConnect, session.ehlo(&self.config.helo_name))
            .await?;
        Ok(session)
    }

    async fn connect_implicit_tls(&self, deadline: &Deadline) -> Result<Session, MailError> {
        let stream = deadline.bound(Stage::Connect, self.dial()).await?;
        let upgraded = deadline
            .bound(
                Stage::TlsConnect,
                self.tls.upgrade(
                    stream,
                    &self.config.host,
                    verifies_chain(&self.config, SecurityMode::ImplicitTls),
                ),
            )
            .await?;
        let mut session = SmtpClient::new(upgraded);
        deadline
            .bound(Stage::Connect, self.greet(&mut session))
            .await?;
        Ok(session)
    }

    fn should_authenticate(&self, mode: SecurityMode) -> bool {
        mode.authenticates() && self.config.has_credentials()
    }
}

#[async_trait::async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, request: MailerRequest) -> Result<(), MailError> {
        let mode = self.config.security_mode()?;
        if request.recipients.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let deadline = Deadline::start(&self.config);
        let mut session = self.connect(mode, &deadline).await?;

        if self.should_authenticate(mode) {
            deadline
                .bound(
                    Stage::Authenticate,
                    session.auth_login(&self.config.username, &self.config.password),
                )
                .await?;
        }

        let from = self.config.sender();
        let to: Vec<&str> = request.recipients.iter().map(|r| r.email.as_str()).collect();
        let message = compose(from, &request);
        deadline
            .bound(Stage::Send, session.send_mail(from, &to, &message))
            .await?;

        // the message is accepted at this point
        if let Err(e) = deadline.bound(Stage::Send, session.quit()).await {
            debug!("SMTP QUIT failed: {e}");
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), MailError> {
        let mode = self.config.security_mode()?;
        let deadline = Deadline::start(&self.config);
        let mut session = self.connect(mode, &deadline).await?;
        deadline.bound(Stage::Connect, session.noop()).await?;
        if let Err(e) = deadline.bound(Stage::Connect, session.quit()).await {
            debug!("SMTP QUIT failed: {e}");
        }
        Ok(())
    }
}
