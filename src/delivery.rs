use crate::config::DeliveryConfig;
use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::commands::{Data, Mail, Rcpt};
use lettre::transport::smtp::extension::{ClientId, Extension, MailBodyParameter, MailParameter};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub type SmtpError = lettre::transport::smtp::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to connect to SMTP relay: {0}")]
    ConnectFailed(#[source] SmtpError),
    #[error("STARTTLS upgrade failed: {0}")]
    TlsUpgradeFailed(#[source] SmtpError),
    #[error("relay does not offer STARTTLS and TLS is required")]
    TlsUnavailable,
    #[error("SMTP authentication failed: {0}")]
    AuthFailed(#[source] SmtpError),
    #[error("sender rejected: {0}")]
    SenderRejected(#[source] SmtpError),
    #[error("recipient rejected: {0}")]
    RecipientRejected(#[source] SmtpError),
    #[error("message transmission failed: {0}")]
    TransmissionFailed(#[source] SmtpError),
    #[error("SMTP session timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Stub(String),
}

/// Anything that can hand a finished message to a mail relay.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, message: &[u8]) -> Result<(), DeliveryError>;
}

/// How the session gets encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// TLS from the first byte (SMTPS)
    ImplicitTls,
    /// Plain connect, upgraded with STARTTLS when offered
    StartTls,
}

impl Security {
    pub fn for_port(port: u16) -> Self {
        if port == 465 {
            Security::ImplicitTls
        } else {
            Security::StartTls
        }
    }
}

pub struct SmtpMailer {
    config: DeliveryConfig,
    security: Security,
    hello: ClientId,
}

impl SmtpMailer {
    pub fn new(config: DeliveryConfig) -> Self {
        let security = Security::for_port(config.port);
        Self {
            config,
            security,
            hello: ClientId::default(),
        }
    }

    pub fn security(&self) -> Security {
        self.security
    }

    fn tls_parameters(&self) -> Result<TlsParameters, SmtpError> {
        TlsParameters::new(self.config.host.clone())
    }

    async fn connect(&self) -> Result<AsyncSmtpConnection, DeliveryError> {
        let server = (self.config.host.as_str(), self.config.port);
        let timeout = Some(self.config.timeout);

        match self.security {
            Security::ImplicitTls => {
                let tls = self.tls_parameters().map_err(DeliveryError::ConnectFailed)?;
                AsyncSmtpConnection::connect_tokio1(server, timeout, &self.hello, Some(tls), None)
                    .await
                    .map_err(DeliveryError::ConnectFailed)
            }
            Security::StartTls => {
                let mut conn =
                    AsyncSmtpConnection::connect_tokio1(server, timeout, &self.hello, None, None)
                        .await
                        .map_err(DeliveryError::ConnectFailed)?;

                if conn.can_starttls() {
                    let tls = self
                        .tls_parameters()
                        .map_err(DeliveryError::TlsUpgradeFailed)?;
                    if let Err(e) = conn.starttls(tls, &self.hello).await {
                        conn.abort().await;
                        return Err(DeliveryError::TlsUpgradeFailed(e));
                    }
                    log::debug!("STARTTLS negotiated with {}", self.config.host);
                } else if self.config.require_tls {
                    conn.abort().await;
                    return Err(DeliveryError::TlsUnavailable);
                } else {
                    log::warn!(
                        "{}:{} does not offer STARTTLS, sending credentials unencrypted",
                        self.config.host,
                        self.config.port
                    );
                }
                Ok(conn)
            }
        }
    }

    /// Authenticate and run one mail transaction on an open connection.
    async fn transact(
        &self,
        conn: &mut AsyncSmtpConnection,
        message: &[u8],
    ) -> Result<(), DeliveryError> {
        let credentials =
            Credentials::new(self.config.username.clone(), self.config.password.clone());
        conn.auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
            .await
            .map_err(DeliveryError::AuthFailed)?;

        let mut params = Vec::new();
        if !message.is_ascii() && conn.server_info().supports_feature(Extension::EightBitMime) {
            params.push(MailParameter::Body(MailBodyParameter::EightBitMime));
        }
        conn.command(Mail::new(Some(self.config.from.email.clone()), params))
            .await
            .map_err(DeliveryError::SenderRejected)?;
        conn.command(Rcpt::new(self.config.to.email.clone(), vec![]))
            .await
            .map_err(DeliveryError::RecipientRejected)?;
        conn.command(Data)
            .await
            .map_err(DeliveryError::TransmissionFailed)?;
        conn.message(message)
            .await
            .map_err(DeliveryError::TransmissionFailed)?;
        Ok(())
    }

    async fn session(&self, message: &[u8]) -> Result<(), DeliveryError> {
        let mut conn = self.connect().await?;

        if let Err(e) = self.transact(&mut conn, message).await {
            conn.abort().await;
            return Err(e);
        }
        if let Err(e) = conn.quit().await {
            log::warn!("QUIT failed after successful delivery: {e}");
        }
        Ok(())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn deliver(&self, message: &[u8]) -> Result<(), DeliveryError> {
        let message = crlf_line_endings(message);
        let message = message.as_slice();
        log::debug!(
            "Delivering {} bytes via {}:{} ({:?})",
            message.len(),
            self.config.host,
            self.config.port,
            self.security
        );
        tokio::time::timeout(self.config.timeout, self.session(message))
            .await
            .map_err(|_| DeliveryError::TimedOut(self.config.timeout))?
    }
}

/// Rewrite every lone CR or LF as CRLF. The relay only sees dot-stuffed
/// `\r\n.` sequences, so no body line can end DATA early.
pub fn crlf_line_endings(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + message.len() / 32);
    let mut bytes = message.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        match byte {
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                bytes.next_if_eq(&b'\n');
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            _ => out.push(byte),
        }
    }
    out
}

/// In-memory mailer that records what it is given.
#[derive(Default)]
pub struct StubMailer {
    failure: Option<String>,
    messages: Mutex<Vec<Vec<u8>>>,
}

impl StubMailer {
    pub fn new_ok() -> Self {
        Self::default()
    }

    pub fn new_failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Mailer for StubMailer {
    async fn deliver(&self, message: &[u8]) -> Result<(), DeliveryError> {
        if let Some(reason) = &self.failure {
            return Err(DeliveryError::Stub(reason.clone()));
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_vec());
        Ok(())
    }
}
