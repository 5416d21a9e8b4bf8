//! Minimal SMTP client state machine (RFC 5321) over any async byte stream

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use super::message::encode_data;

#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("server replied {code}: {message}")]
    Reply { code: u16, message: String },
    #[error("malformed server reply {0:?}")]
    Malformed(String),
    #[error("connection closed by server")]
    Closed,
    #[error("server does not advertise STARTTLS")]
    StartTlsUnsupported,
    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),
    #[error("TLS setup failed")]
    Tls(#[from] rustls::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    fn message(&self) -> String {
        self.lines.join(" ")
    }

    /// EHLO keywords live on every line after the greeting line.
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|k| k.eq_ignore_ascii_case(keyword))
        })
    }

    fn expect(self, accepted: &[u16]) -> Result<Self, SmtpError> {
        if accepted.contains(&self.code) {
            Ok(self)
        } else {
            Err(SmtpError::Reply {
                code: self.code,
                message: self.message(),
            })
        }
    }
}

pub(crate) struct SmtpClient<S> {
    stream: BufReader<S>,
}

impl<S> SmtpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Hands back the raw stream, e.g. for a TLS upgrade. Only valid between
    /// replies, when nothing is buffered.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    pub async fn read_reply(&mut self) -> Result<Reply, SmtpError> {
        let mut lines = Vec::new();
        loop {
            let mut raw = String::new();
            if self.stream.read_line(&mut raw).await? == 0 {
                return Err(SmtpError::Closed);
            }
            let line = raw.trim_end_matches(&['\r', '\n'][..]);
            trace!("< {line}");
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| SmtpError::Malformed(line.to_string()))?;
            lines.push(line.get(4..).unwrap_or_default().to_string());
            match line.as_bytes().get(3) {
                Some(b'-') => continue,
                Some(b' ') | None => return Ok(Reply { code, lines }),
                Some(_) => return Err(SmtpError::Malformed(line.to_string())),
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let writer = self.stream.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await
    }

    async fn command(&mut self, line: &str, accepted: &[u16]) -> Result<Reply, SmtpError> {
        trace!("> {line}");
        self.write_line(line).await?;
        self.read_reply().await?.expect(accepted)
    }

    pub async fn greeting(&mut self) -> Result<Reply, SmtpError> {
        self.read_reply().await?.expect(&[220])
    }

    /// Sends `EHLO`, falling back to `HELO` for servers that reject it.
    pub async fn ehlo(&mut self, name: &str) -> Result<Reply, SmtpError> {
        self.write_line(&format!("EHLO {name}")).await?;
        let reply = self.read_reply().await?;
        if (500..600).contains(&reply.code) {
            return self.command(&format!("HELO {name}"), &[250]).await;
        }
        reply.expect(&[250])
    }

    pub async fn starttls(&mut self) -> Result<(), SmtpError> {
        self.command("STARTTLS", &[220]).await?;
        Ok(())
    }

    /// `AUTH LOGIN`: username and password each answer a 334 challenge.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<(), SmtpError> {
        self.command("AUTH LOGIN", &[334]).await?;
        self.write_line(&BASE64.encode(username)).await?;
        self.read_reply().await?.expect(&[334])?;
        self.write_line(&BASE64.encode(password)).await?;
        self.read_reply().await?.expect(&[235])?;
        Ok(())
    }

    pub async fn send_mail(
        &mut self,
        from: &str,
        recipients: &[&str],
        message: &str,
    ) -> Result<(), SmtpError> {
        self.command(&format!("MAIL FROM:<{from}>"), &[250]).await?;
        for rcpt in recipients {
            self.command(&format!("RCPT TO:<{rcpt}>"), &[250, 251]).await?;
        }
        self.command("DATA", &[354]).await?;

        let writer = self.stream.get_mut();
        writer.write_all(&encode_data(message)).await?;
        writer.flush().await?;
        self.read_reply().await?.expect(&[250])?;
        Ok(())
    }

    pub async fn noop(&mut self) -> Result<(), SmtpError> {
        self.command("NOOP", &[250]).await?;
        Ok(())
    }

    pub async fn quit(&mut self) -> Result<(), SmtpError> {
        self.command("QUIT", &[221]).await?;
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}
