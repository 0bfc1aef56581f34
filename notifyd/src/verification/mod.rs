//! Verification codes for receiver contacts.
//!
//! One outstanding code per `(receiver, channel)`. Re-issuing inside
//! `expire_interval` is throttled; a code is accepted until
//! `valid_interval` after it was issued.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use serde_json::json;
use tracing::{debug, info};

use crate::database::models::VerificationDbModel;
use crate::database::repositories::VerificationRepository;
use crate::database::time::now_ms;
use crate::notification::channels::{DriverRegistry, EMAIL, MOBILE, Recipient, SendParams};
use crate::receiver::{ReceiverDetails, ReceiverDirectory};
use crate::template::{TemplateStore, VERIFY_TOPIC};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Minimum gap between two codes for the same pair.
    pub expire_interval: Duration,
    /// How long a code is accepted.
    pub valid_interval: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            expire_interval: Duration::from_secs(120),
            valid_interval: Duration::from_secs(300),
        }
    }
}

/// Six digits for SMS, 32 url-safe characters for email.
fn generate_token(channel: &str) -> String {
    if channel == MOBILE {
        format!("{:06}", rand::rng().random_range(0..1_000_000u32))
    } else {
        let bytes: [u8; 24] = rand::random();
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

fn ensure_token_channel(channel: &str) -> Result<()> {
    if channel == EMAIL || channel == MOBILE {
        Ok(())
    } else {
        Err(Error::input_invalid(format!(
            "channel '{}' cannot be verified by code",
            channel
        )))
    }
}

fn current_contact(details: &ReceiverDetails, channel: &str) -> String {
    match channel {
        EMAIL => details.receiver.email.clone(),
        _ => details.receiver.mobile.clone(),
    }
}

pub struct VerificationManager {
    repo: Arc<dyn VerificationRepository>,
    receivers: Arc<ReceiverDirectory>,
    drivers: Arc<DriverRegistry>,
    templates: Arc<TemplateStore>,
    config: VerificationConfig,
    brand: String,
}

impl VerificationManager {
    pub fn new(
        repo: Arc<dyn VerificationRepository>,
        receivers: Arc<ReceiverDirectory>,
        drivers: Arc<DriverRegistry>,
        templates: Arc<TemplateStore>,
        config: VerificationConfig,
        brand: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            receivers,
            drivers,
            templates,
            config,
            brand: brand.into(),
        }
    }

    pub async fn create(&self, receiver_id: &str, channel: &str) -> Result<VerificationDbModel> {
        self.create_at(receiver_id, channel, now_ms()).await
    }

    /// Issue a code at `now` (epoch ms) for the receiver's current contact.
    pub async fn create_at(
        &self,
        receiver_id: &str,
        channel: &str,
        now: i64,
    ) -> Result<VerificationDbModel> {
        ensure_token_channel(channel)?;
        let details = self.receivers.get(receiver_id).await?;
        let contact = current_contact(&details, channel);
        if contact.is_empty() {
            return Err(Error::input_invalid(format!(
                "receiver {} has no {}",
                receiver_id, channel
            )));
        }
        let row = VerificationDbModel {
            receiver_id: receiver_id.to_string(),
            channel: channel.to_string(),
            token: generate_token(channel),
            contact,
            created_at: now,
        };
        let throttle_ms = self.config.expire_interval.as_millis() as i64;
        if !self.repo.issue(&row, throttle_ms).await? {
            debug!(receiver_id, channel, "Verification throttled");
            return Err(Error::VerifyFrequently);
        }
        Ok(row)
    }

    pub async fn verify(&self, receiver_id: &str, channel: &str, token: &str) -> Result<()> {
        self.verify_at(receiver_id, channel, token, now_ms()).await
    }

    /// Check `token` at `now` (epoch ms) and mark the contact verified.
    pub async fn verify_at(
        &self,
        receiver_id: &str,
        channel: &str,
        token: &str,
        now: i64,
    ) -> Result<()> {
        let row = self
            .repo
            .get_verification(receiver_id, channel)
            .await?
            .ok_or_else(|| Error::not_found("Verification", format!("{}/{}", receiver_id, channel)))?;

        let valid_ms = self.config.valid_interval.as_millis() as i64;
        if now >= row.created_at.saturating_add(valid_ms) {
            return Err(Error::VerifyExpired);
        }
        if row.token.as_bytes() != token.as_bytes() {
            return Err(Error::VerifyIncorrect);
        }
        // A code only proves ownership of the address it was sent to.
        let details = self.receivers.get(receiver_id).await?;
        if current_contact(&details, channel) != row.contact {
            self.repo.delete_verification(receiver_id, channel).await?;
            debug!(receiver_id, channel, "Contact changed since the code was issued");
            return Err(Error::VerifyExpired);
        }

        self.receivers.mark_verified(receiver_id, channel).await?;
        self.repo.delete_verification(receiver_id, channel).await?;
        info!(receiver_id, channel, "Contact verified");
        Ok(())
    }

    /// Start verification of a receiver's contact on `channel`.
    ///
    /// Pull-type channels resolve the contact from the vendor instead of
    /// sending a code.
    pub async fn trigger_verify(&self, receiver_id: &str, channel: &str) -> Result<()> {
        let driver = self.drivers.get(channel)?;
        if driver.capabilities().is_pull_type {
            let resolved = self
                .receivers
                .pull_sub_contacts(receiver_id, &[channel.to_string()])
                .await?;
            if resolved.is_empty() {
                return Err(Error::not_found(
                    format!("{} contact", channel),
                    receiver_id,
                ));
            }
            return Ok(());
        }
        ensure_token_channel(channel)?;

        let details = self.receivers.get(receiver_id).await?;
        let row = self.create(receiver_id, channel).await?;
        let message = json!({ "code": row.token, "brand": self.brand }).to_string();
        let rendered = self
            .templates
            .render(VERIFY_TOPIC, channel, &details.receiver.lang, &message)
            .await?;

        let params = SendParams {
            receivers: vec![Recipient::new(&row.contact, &details.receiver.domain_id)],
            topic: VERIFY_TOPIC.to_string(),
            title: rendered.title,
            message: rendered.message,
            remote_template: rendered.remote_template,
            remote_template_param: Some(serde_json::Map::from_iter([(
                "code".to_string(),
                row.token.clone().into(),
            )])),
            ..Default::default()
        };
        let timeout = driver.timeout().unwrap_or(Duration::from_secs(60));
        tokio::time::timeout(timeout, driver.send(&params))
            .await
            .map_err(|_| Error::Timeout)??;
        info!(receiver_id, channel, "Verification code sent");
        Ok(())
    }
}
