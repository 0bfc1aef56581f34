//! Email channel over SMTP.
//!
//! One pooled transport per domain keeps a single connection open and
//! drops it after 30 seconds idle; the next send reopens it. A config
//! change yields a new fingerprint and therefore a fresh transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::PoolConfig;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{
    Capabilities, ChannelDriver, ConfigRejection, ContactFailure, EMAIL, Recipient, SendParams,
};
use crate::credentials::TokenCache;
use crate::database::models::ConfigContent;
use crate::{Error, Result};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Transport = AsyncSmtpTransport<Tokio1Executor>;

pub struct EmailDriver {
    cache: Arc<TokenCache>,
    /// domain id -> (config fingerprint, transport)
    transports: DashMap<String, (String, Arc<Transport>)>,
    /// Verify server certificates.
    ssl_global: bool,
    timeout: Duration,
}

fn smtp_error(err: lettre::transport::smtp::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else if err.is_permanent() {
        Error::vendor_rejected(err.to_string())
    } else {
        Error::Transient(err.to_string())
    }
}

fn fingerprint(config: &ConfigContent) -> String {
    let raw = serde_json::to_vec(&config.0).unwrap_or_default();
    hex::encode(Sha256::digest(&raw))
}

impl EmailDriver {
    pub fn new(cache: Arc<TokenCache>, ssl_global: bool, timeout: Duration) -> Self {
        Self {
            cache,
            transports: DashMap::new(),
            ssl_global,
            timeout,
        }
    }

    fn build_transport(&self, config: &ConfigContent) -> Result<Transport> {
        let host = config.require(EMAIL, "hostname")?;
        let ssl = config.get_bool("ssl");
        let port = config
            .get("hostport")
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(if ssl { 465 } else { 25 });

        let tls_parameters = TlsParameters::builder(host.clone())
            .dangerous_accept_invalid_certs(!self.ssl_global)
            .build()
            .map_err(smtp_error)?;
        let tls = if ssl {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Opportunistic(tls_parameters)
        };

        let mut builder = Transport::builder_dangerous(host)
            .port(port)
            .tls(tls)
            .timeout(Some(self.timeout))
            .pool_config(PoolConfig::new().max_size(1).idle_timeout(IDLE_TIMEOUT));
        if let (Some(username), Some(password)) = (config.get("username"), config.get("password")) {
            builder = builder.credentials(Credentials::new(username, password));
        }
        Ok(builder.build())
    }

    async fn transport_for(&self, domain_id: &str) -> Result<(Arc<Transport>, Mailbox)> {
        let config = self.cache.credentials(EMAIL, domain_id).await?;
        let sender = config
            .get("sender_address")
            .or_else(|| config.get("username"))
            .ok_or_else(|| Error::incomplete_config(EMAIL, "missing 'sender_address'"))?;
        let from: Mailbox = sender
            .parse()
            .map_err(|e| Error::incomplete_config(EMAIL, format!("invalid sender: {}", e)))?;

        let fp = fingerprint(&config);
        if let Some(entry) = self.transports.get(domain_id)
            && entry.0 == fp
        {
            return Ok((entry.1.clone(), from));
        }
        let transport = Arc::new(self.build_transport(&config)?);
        self.transports
            .insert(domain_id.to_string(), (fp, transport.clone()));
        debug!(domain_id, "Created SMTP transport");
        Ok((transport, from))
    }

    fn build_message(from: &Mailbox, to: &str, params: &SendParams) -> Result<Message> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| Error::input_invalid(format!("invalid email '{}': {}", to, e)))?;
        let builder = Message::builder()
            .from(from.clone())
            .to(to)
            .subject(params.title.clone());
        let html = SinglePart::html(params.message.clone());

        let message = if params.attachments.is_empty() {
            builder.singlepart(html)
        } else {
            let mut multipart = MultiPart::mixed().singlepart(html);
            for attachment in &params.attachments {
                let content = STANDARD.decode(&attachment.content).map_err(|e| {
                    Error::input_invalid(format!("attachment {}: {}", attachment.filename, e))
                })?;
                let content_type = ContentType::parse(&attachment.mime)
                    .or_else(|_| ContentType::parse("application/octet-stream"))
                    .map_err(|e| Error::input_invalid(e.to_string()))?;
                multipart = multipart.singlepart(
                    MailAttachment::new(attachment.filename.clone()).body(content, content_type),
                );
            }
            builder.multipart(multipart)
        };
        message.map_err(|e| Error::input_invalid(format!("invalid email: {}", e)))
    }

    async fn send_one(&self, transport: &Transport, from: &Mailbox, to: &Recipient, params: &SendParams) -> Result<()> {
        let message = Self::build_message(from, &to.contact, params)?;
        transport.send(message).await.map_err(smtp_error)?;
        Ok(())
    }
}

#[async_trait]
impl ChannelDriver for EmailDriver {
    fn channel_type(&self) -> &'static str {
        EMAIL
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_personal: true,
            ..Default::default()
        }
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let recipient = params.single()?;
        let (transport, from) = self.transport_for(&recipient.domain_id).await?;
        self.send_one(&transport, &from, recipient, params).await
    }

    fn supports_batch(&self) -> bool {
        true
    }

    /// One SMTP transaction per recipient over the domain's connection.
    async fn send_batch(&self, params: &SendParams) -> Result<Vec<ContactFailure>> {
        let domain_id = params
            .receivers
            .first()
            .map(|r| r.domain_id.as_str())
            .ok_or_else(|| Error::input_invalid("no receiver"))?;
        let (transport, from) = self.transport_for(domain_id).await?;

        let mut failures = Vec::new();
        for recipient in &params.receivers {
            if let Err(error) = self.send_one(&transport, &from, recipient, params).await {
                warn!(contact = %recipient.contact, error = %error, "Email delivery failed");
                failures.push(ContactFailure {
                    contact: recipient.contact.clone(),
                    error,
                });
            }
        }
        Ok(failures)
    }

    async fn validate_config(&self, config: &ConfigContent) -> std::result::Result<(), ConfigRejection> {
        let transport = self
            .build_transport(config)
            .map_err(|e| ConfigRejection::new("hostname is required", e))?;
        match transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ConfigRejection::new(
                "SMTP server did not accept the connection",
                Error::vendor_rejected("connection test failed"),
            )),
            Err(e) => Err(ConfigRejection::new(
                "unable to connect to the SMTP server, check hostname, port and credentials",
                smtp_error(e),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Attachment;
    use super::*;

    fn from() -> Mailbox {
        "noreply@example.com".parse().unwrap()
    }

    #[test]
    fn test_build_message() {
        let params = SendParams {
            title: "Disk full".to_string(),
            message: "<b>vm1</b>".to_string(),
            ..Default::default()
        };
        let message = EmailDriver::build_message(&from(), "a@b.c", &params).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Disk full"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let params = SendParams::default();
        assert!(matches!(
            EmailDriver::build_message(&from(), "not-an-address", &params),
            Err(Error::InputInvalid(_))
        ));
    }

    #[test]
    fn test_build_message_with_attachment() {
        let params = SendParams {
            title: "Report".to_string(),
            message: "see attached".to_string(),
            attachments: vec![Attachment {
                filename: "report.txt".to_string(),
                mime: "text/plain".to_string(),
                content: STANDARD.encode("hello"),
            }],
            ..Default::default()
        };
        let message = EmailDriver::build_message(&from(), "a@b.c", &params).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("report.txt"));
    }

    #[test]
    fn test_fingerprint_changes_with_config() {
        let a = ConfigContent::from_pairs([("hostname", "smtp.a")]);
        let b = ConfigContent::from_pairs([("hostname", "smtp.b")]);
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
