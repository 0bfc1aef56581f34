//! Receiver directory: per-user contacts with enable/verify bits per channel.
//!
//! Receivers are created by admins or synced from the identity service. The
//! directory answers the dispatcher's eligibility question: may channel `c`
//! deliver to receiver `r`, and at which contact.

mod robot;

pub use robot::{RobotCreate, RobotService};

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::models::{ReceiverDbModel, SubContactDbModel};
use crate::database::repositories::{ReceiverRepository, SubscriberRepository};
use crate::identity::{IdentityClient, IdentityUser, UserEvent};
use crate::notification::channels::{
    Capabilities, DriverFilter, DriverRegistry, EMAIL, MOBILE,
};
use crate::{Error, Result};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+$").unwrap());
static MOBILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\+\d{1,4} )?\d{6,14}$").unwrap());

const EMAIL_CHANGED_NOTE: &str = "email changed, re-verify";
const MOBILE_CHANGED_NOTE: &str = "mobile changed, re-verify";

#[derive(Debug, Clone, Default)]
pub struct ReceiverConfig {
    /// Mark contacts verified when an admin creates or updates a receiver
    /// with `force_verified`, and when syncing from the identity service.
    pub implicit_admin_verify: bool,
}

pub fn validate_email(email: &str) -> Result<()> {
    if EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(Error::input_invalid(format!("invalid email '{}'", email)))
    }
}

/// Accepts `[0-9]{6,14}` with an optional `+CC ` country prefix.
pub fn validate_mobile(mobile: &str) -> Result<()> {
    if MOBILE_RE.is_match(mobile) {
        Ok(())
    } else {
        Err(Error::input_invalid(format!("invalid mobile '{}'", mobile)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiverCreate {
    pub id: String,
    pub name: String,
    pub domain_id: String,
    pub lang: String,
    pub email: String,
    pub mobile: String,
    pub enabled_contact_types: Vec<String>,
    /// Only honored when `implicit_admin_verify` is on.
    pub force_verified: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiverUpdate {
    pub name: Option<String>,
    pub lang: Option<String>,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub enabled: Option<bool>,
    pub enabled_contact_types: Option<Vec<String>>,
    pub force_verified: bool,
}

/// A receiver together with its channel-specific contacts.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiverDetails {
    #[serde(flatten)]
    pub receiver: ReceiverDbModel,
    pub sub_contacts: Vec<SubContactDbModel>,
}

impl ReceiverDetails {
    fn sub_contact(&self, channel: &str) -> Option<&SubContactDbModel> {
        self.sub_contacts.iter().find(|s| s.contact_type == channel)
    }

    /// Enabled channel names.
    pub fn enabled_contact_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        if self.receiver.enabled_email {
            types.push(EMAIL.to_string());
        }
        if self.receiver.enabled_mobile {
            types.push(MOBILE.to_string());
        }
        types.extend(
            self.sub_contacts
                .iter()
                .filter(|s| s.enabled)
                .map(|s| s.contact_type.clone()),
        );
        types
    }

    /// Contact string for `channel`.
    ///
    /// System-config channels address the receiver id; robot channels
    /// mention the receiver by mobile.
    pub fn contact(&self, channel: &str, caps: Capabilities) -> String {
        if caps.is_system_config {
            return self.receiver.id.clone();
        }
        match channel {
            EMAIL => self.receiver.email.clone(),
            MOBILE => self.receiver.mobile.clone(),
            _ if caps.is_robot => self.receiver.mobile.clone(),
            _ => self
                .sub_contact(channel)
                .map(|s| s.contact.clone())
                .unwrap_or_default(),
        }
    }

    fn channel_bits(&self, channel: &str, caps: Capabilities) -> (bool, bool) {
        if caps.is_system_config {
            return (true, true);
        }
        match channel {
            EMAIL => (self.receiver.enabled_email, self.receiver.verified_email),
            MOBILE => (self.receiver.enabled_mobile, self.receiver.verified_mobile),
            _ if caps.is_robot => (self.receiver.enabled_mobile, self.receiver.verified_mobile),
            _ => self
                .sub_contact(channel)
                .map(|s| (s.enabled, s.verified))
                .unwrap_or((false, false)),
        }
    }

    /// The contact to deliver to on `channel`, or the reason not to.
    ///
    /// Checks run in order: receiver disabled, channel not enabled, channel
    /// not verified, empty contact.
    pub fn eligible_contact(&self, channel: &str, caps: Capabilities) -> Result<String> {
        if !self.receiver.enabled || self.receiver.deleted {
            return Err(Error::Forbidden(format!(
                "receiver {} is disabled",
                self.receiver.id
            )));
        }
        let (enabled, verified) = self.channel_bits(channel, caps);
        if !enabled {
            return Err(Error::Forbidden(format!(
                "channel {} is not enabled for receiver {}",
                channel, self.receiver.id
            )));
        }
        if !verified {
            return Err(Error::Forbidden(format!(
                "channel {} is not verified for receiver {}",
                channel, self.receiver.id
            )));
        }
        let contact = self.contact(channel, caps);
        if contact.is_empty() {
            return Err(Error::input_invalid(format!(
                "empty {} contact for receiver {}",
                channel, self.receiver.id
            )));
        }
        Ok(contact)
    }
}

pub struct ReceiverDirectory {
    repo: Arc<dyn ReceiverRepository>,
    subscribers: Arc<dyn SubscriberRepository>,
    drivers: Arc<DriverRegistry>,
    identity: Arc<dyn IdentityClient>,
    config: ReceiverConfig,
}

impl ReceiverDirectory {
    pub fn new(
        repo: Arc<dyn ReceiverRepository>,
        subscribers: Arc<dyn SubscriberRepository>,
        drivers: Arc<DriverRegistry>,
        identity: Arc<dyn IdentityClient>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            repo,
            subscribers,
            drivers,
            identity,
            config,
        }
    }

    pub async fn get(&self, id: &str) -> Result<ReceiverDetails> {
        let receiver = self.repo.get_receiver(id).await?;
        if receiver.deleted {
            return Err(Error::not_found("Receiver", id));
        }
        self.details(receiver).await
    }

    /// Look up by id, then by name.
    pub async fn find(&self, ident: &str) -> Result<Option<ReceiverDetails>> {
        match self.repo.find_by_id_or_name(ident).await? {
            Some(receiver) => Ok(Some(self.details(receiver).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<ReceiverDetails>> {
        let receivers = self.repo.list_by_ids(ids).await?;
        let mut details = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            details.push(self.details(receiver).await?);
        }
        Ok(details)
    }

    async fn details(&self, receiver: ReceiverDbModel) -> Result<ReceiverDetails> {
        let sub_contacts = self.repo.list_sub_contacts(&receiver.id).await?;
        Ok(ReceiverDetails {
            receiver,
            sub_contacts,
        })
    }

    fn validate_contact_types(&self, types: &[String]) -> Result<()> {
        let valid = self.drivers.names(DriverFilter::PersonalValid);
        for t in types {
            if !valid.contains(&t.as_str()) {
                return Err(Error::input_invalid(format!("unknown contact type '{}'", t)));
            }
        }
        Ok(())
    }

    fn implicit_verify(&self, force_verified: bool) -> bool {
        force_verified && self.config.implicit_admin_verify
    }

    pub async fn create_receiver(&self, request: ReceiverCreate) -> Result<ReceiverDetails> {
        if request.id.is_empty() {
            return Err(Error::input_invalid("receiver id is required"));
        }
        if !request.email.is_empty() {
            validate_email(&request.email)?;
        }
        if !request.mobile.is_empty() {
            validate_mobile(&request.mobile)?;
        }
        self.validate_contact_types(&request.enabled_contact_types)?;

        let name = if request.name.is_empty() {
            request.id.clone()
        } else {
            request.name.clone()
        };
        let mut receiver = ReceiverDbModel::new(&request.id, name, &request.domain_id);
        receiver.lang = request.lang.clone();
        receiver.email = request.email.clone();
        receiver.mobile = request.mobile.clone();

        let enabled: HashSet<&str> = request
            .enabled_contact_types
            .iter()
            .map(String::as_str)
            .collect();
        receiver.enabled_email = enabled.contains(EMAIL);
        receiver.enabled_mobile = enabled.contains(MOBILE);
        if self.implicit_verify(request.force_verified) {
            receiver.verified_email = receiver.enabled_email && !receiver.email.is_empty();
            receiver.verified_mobile = receiver.enabled_mobile && !receiver.mobile.is_empty();
        }
        self.repo.create_receiver(&receiver).await?;

        for channel in enabled.iter().filter(|c| **c != EMAIL && **c != MOBILE) {
            let mut sub = SubContactDbModel::new(&receiver.id, *channel);
            sub.enabled = true;
            self.repo.upsert_sub_contact(&sub).await?;
        }

        info!(receiver_id = %receiver.id, domain_id = %receiver.domain_id, "Created receiver");
        self.details(receiver).await
    }

    /// Apply `update`. Changing a primary contact clears its verified bit
    /// and that of every sub-contact derived from it.
    pub async fn update_receiver(&self, id: &str, update: ReceiverUpdate) -> Result<ReceiverDetails> {
        let ReceiverDetails {
            mut receiver,
            mut sub_contacts,
        } = self.get(id).await?;

        if let Some(name) = update.name {
            receiver.name = name;
        }
        if let Some(lang) = update.lang {
            receiver.lang = lang;
        }
        if let Some(enabled) = update.enabled {
            receiver.enabled = enabled;
        }

        let mut changed_parents = Vec::new();
        if let Some(email) = update.email
            && email != receiver.email
        {
            if !email.is_empty() {
                validate_email(&email)?;
            }
            receiver.email = email;
            receiver.verified_email = false;
            changed_parents.push((EMAIL, EMAIL_CHANGED_NOTE));
        }
        if let Some(mobile) = update.mobile
            && mobile != receiver.mobile
        {
            if !mobile.is_empty() {
                validate_mobile(&mobile)?;
            }
            receiver.mobile = mobile;
            receiver.verified_mobile = false;
            changed_parents.push((MOBILE, MOBILE_CHANGED_NOTE));
        }

        if let Some(types) = &update.enabled_contact_types {
            self.validate_contact_types(types)?;
            let wanted: HashSet<&str> = types.iter().map(String::as_str).collect();
            receiver.enabled_email = wanted.contains(EMAIL);
            receiver.enabled_mobile = wanted.contains(MOBILE);
            for channel in wanted.iter().filter(|c| **c != EMAIL && **c != MOBILE) {
                if !sub_contacts.iter().any(|s| s.contact_type == *channel) {
                    sub_contacts.push(SubContactDbModel::new(&receiver.id, *channel));
                }
            }
            for sub in sub_contacts.iter_mut() {
                sub.enabled = wanted.contains(sub.contact_type.as_str());
            }
        }

        for (parent, note) in &changed_parents {
            for sub in sub_contacts
                .iter_mut()
                .filter(|s| s.parent_contact_type == *parent)
            {
                sub.verified = false;
                sub.verified_note = note.to_string();
            }
        }

        if self.implicit_verify(update.force_verified) {
            receiver.verified_email = receiver.enabled_email && !receiver.email.is_empty();
            receiver.verified_mobile = receiver.enabled_mobile && !receiver.mobile.is_empty();
        }

        self.repo.update_receiver(&receiver).await?;
        for sub in &sub_contacts {
            self.repo.upsert_sub_contact(sub).await?;
        }
        debug!(receiver_id = %receiver.id, "Updated receiver");
        self.details(receiver).await
    }

    /// Soft-delete and drop every subscriber link.
    pub async fn delete_receiver(&self, id: &str) -> Result<()> {
        self.repo.soft_delete_receiver(id).await?;
        let removed = self.subscribers.remove_receiver(id).await?;
        info!(receiver_id = id, links_removed = removed, "Deleted receiver");
        Ok(())
    }

    /// Set the verified bit of `channel` and clear its note.
    pub async fn mark_verified(&self, id: &str, channel: &str) -> Result<()> {
        let mut details = self.get(id).await?;
        match channel {
            EMAIL => details.receiver.verified_email = true,
            MOBILE => details.receiver.verified_mobile = true,
            _ => {
                let mut sub = details
                    .sub_contact(channel)
                    .cloned()
                    .ok_or_else(|| Error::not_found("Sub-contact", channel))?;
                sub.verified = true;
                sub.verified_note.clear();
                return self.repo.upsert_sub_contact(&sub).await;
            }
        }
        self.repo.update_receiver(&details.receiver).await
    }

    /// Resolve pull-type contacts from the vendor by the receiver's mobile.
    ///
    /// Each channel is stored as a sub-contact derived from `mobile`;
    /// failures leave it unverified with the error as note. Returns the
    /// channels that resolved.
    pub async fn pull_sub_contacts(&self, id: &str, channels: &[String]) -> Result<Vec<String>> {
        let details = self.get(id).await?;
        let receiver = &details.receiver;
        let mut resolved = Vec::new();

        for channel in channels {
            let driver = self.drivers.get(channel)?;
            if !driver.capabilities().is_pull_type {
                continue;
            }
            let mut sub = details
                .sub_contact(channel)
                .cloned()
                .unwrap_or_else(|| SubContactDbModel::new(&receiver.id, channel.as_str()));
            sub.parent_contact_type = MOBILE.to_string();

            let outcome = if receiver.mobile.is_empty() {
                Err(Error::input_invalid("receiver has no mobile"))
            } else {
                driver
                    .contact_by_mobile(&receiver.mobile, &receiver.domain_id)
                    .await
            };
            match outcome {
                Ok(contact) => {
                    sub.contact = contact;
                    sub.verified = true;
                    sub.verified_note.clear();
                    resolved.push(channel.clone());
                }
                Err(e) => {
                    warn!(receiver_id = %receiver.id, channel = %channel, error = %e, "Contact pull failed");
                    sub.verified = false;
                    sub.verified_note = e.to_string();
                }
            }
            self.repo.upsert_sub_contact(&sub).await?;
        }
        Ok(resolved)
    }

    /// Create or fill a receiver from an identity user.
    ///
    /// System accounts and users without any contact are skipped.
    pub async fn sync_user(&self, user: &IdentityUser) -> Result<Option<ReceiverDetails>> {
        if user.is_system_account || (user.email.is_empty() && user.mobile.is_empty()) {
            return Ok(None);
        }
        let verify = self.config.implicit_admin_verify;

        if let Some(mut receiver) = self.repo.find_by_id_or_name(&user.id).await? {
            let mut changed = false;
            if receiver.email.is_empty() && !user.email.is_empty() {
                receiver.email = user.email.clone();
                receiver.verified_email = verify;
                changed = true;
            }
            if receiver.mobile.is_empty() && !user.mobile.is_empty() {
                receiver.mobile = user.mobile.clone();
                receiver.verified_mobile = verify;
                changed = true;
            }
            if changed {
                self.repo.update_receiver(&receiver).await?;
            }
            return Ok(Some(self.details(receiver).await?));
        }

        let mut receiver = ReceiverDbModel::new(&user.id, &user.name, &user.domain_id);
        receiver.lang = user.lang.clone();
        if !user.email.is_empty() {
            receiver.email = user.email.clone();
            receiver.enabled_email = true;
            receiver.verified_email = verify;
        }
        if !user.mobile.is_empty() {
            receiver.mobile = user.mobile.clone();
            receiver.enabled_mobile = true;
            receiver.verified_mobile = verify;
        }

        // A user deleted earlier comes back as a fresh receiver under the
        // same id; old sub-contacts are not carried over.
        match self.repo.get_receiver(&user.id).await {
            Ok(previous) if previous.deleted => {
                receiver.created_at = previous.created_at;
                self.repo.delete_sub_contacts(&receiver.id).await?;
                self.repo.update_receiver(&receiver).await?;
                info!(receiver_id = %receiver.id, "Revived receiver from identity");
                return Ok(Some(self.details(receiver).await?));
            }
            Ok(_) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        self.repo.create_receiver(&receiver).await?;
        info!(receiver_id = %receiver.id, "Synced receiver from identity");
        Ok(Some(self.details(receiver).await?))
    }

    /// Sync a receiver by identity id or name.
    pub async fn sync_by_ident(&self, ident: &str) -> Result<Option<ReceiverDetails>> {
        let user = self.identity.get_user(ident).await?;
        self.sync_user(&user).await
    }

    pub async fn on_add(&self, user: &IdentityUser) -> Result<()> {
        debug!(user_id = %user.id, "Identity user added");
        Ok(())
    }

    /// Keep name, domain and language in step with the identity service.
    pub async fn on_update(&self, user: &IdentityUser) -> Result<()> {
        let Some(mut receiver) = self.repo.find_by_id_or_name(&user.id).await? else {
            return Ok(());
        };
        if receiver.name == user.name
            && receiver.domain_id == user.domain_id
            && receiver.lang == user.lang
        {
            return Ok(());
        }
        receiver.name = user.name.clone();
        receiver.domain_id = user.domain_id.clone();
        receiver.lang = user.lang.clone();
        self.repo.update_receiver(&receiver).await?;
        debug!(receiver_id = %receiver.id, "Receiver synced from identity update");
        Ok(())
    }

    pub async fn on_delete(&self, user_id: &str) -> Result<()> {
        if self.repo.find_by_id_or_name(user_id).await?.is_none() {
            return Ok(());
        }
        self.delete_receiver(user_id).await
    }

    /// Consume the identity watch stream until cancelled.
    pub fn start_watch(self: &Arc<Self>, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let mut events = self.identity.watch()?;
        let directory = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Identity watch shutting down");
                        break;
                    }
                    event = events.recv() => {
                        let result = match event {
                            Ok(UserEvent::Added(user)) => directory.on_add(&user).await,
                            Ok(UserEvent::Updated(user)) => directory.on_update(&user).await,
                            Ok(UserEvent::Deleted(id)) => directory.on_delete(&id).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Identity watch lagged");
                                Ok(())
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        };
                        if let Err(e) = result {
                            warn!(error = %e, "Failed to apply identity event");
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{SqlxReceiverRepository, SqlxSubscriberRepository};
    use crate::database::test_pool;
    use crate::identity::StaticIdentityClient;
    use crate::notification::channels::{ChannelDriver, SendParams};
    use async_trait::async_trait;

    struct PullDriver;

    #[async_trait]
    impl ChannelDriver for PullDriver {
        fn channel_type(&self) -> &'static str {
            "dingtalk"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                is_personal: true,
                is_pull_type: true,
                ..Default::default()
            }
        }
        async fn send(&self, _params: &SendParams) -> Result<()> {
            Ok(())
        }
        async fn contact_by_mobile(&self, mobile: &str, _domain_id: &str) -> Result<String> {
            if mobile == "13800000000" {
                Ok("ding-u1".to_string())
            } else {
                Err(Error::not_found("DingTalk user", mobile))
            }
        }
    }

    struct PersonalDriver(&'static str);

    #[async_trait]
    impl ChannelDriver for PersonalDriver {
        fn channel_type(&self) -> &'static str {
            self.0
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                is_personal: true,
                ..Default::default()
            }
        }
        async fn send(&self, _params: &SendParams) -> Result<()> {
            Ok(())
        }
    }

    async fn setup(implicit_admin_verify: bool) -> (ReceiverDirectory, Arc<StaticIdentityClient>) {
        let pool = test_pool().await;
        let mut drivers = DriverRegistry::new();
        drivers
            .register(Arc::new(PersonalDriver(EMAIL)))
            .register(Arc::new(PersonalDriver(MOBILE)))
            .register(Arc::new(PullDriver));
        let identity = Arc::new(StaticIdentityClient::new());
        let directory = ReceiverDirectory::new(
            Arc::new(SqlxReceiverRepository::new(pool.clone())),
            Arc::new(SqlxSubscriberRepository::new(pool)),
            Arc::new(drivers),
            identity.clone(),
            ReceiverConfig {
                implicit_admin_verify,
            },
        );
        (directory, identity)
    }

    fn create_request(id: &str) -> ReceiverCreate {
        ReceiverCreate {
            id: id.to_string(),
            name: id.to_string(),
            domain_id: "D1".to_string(),
            email: "a@b.c".to_string(),
            mobile: "13800000000".to_string(),
            enabled_contact_types: vec![EMAIL.to_string(), "dingtalk".to_string()],
            force_verified: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_contact_validation() {
        assert!(validate_email("a@b.c").is_ok());
        assert!(validate_email("a@").is_err());
        assert!(validate_email("ab.c").is_err());
        assert!(validate_mobile("13800000000").is_ok());
        assert!(validate_mobile("+86 13800000000").is_ok());
        assert!(validate_mobile("12345").is_err());
        assert!(validate_mobile("+86 1380000000000000").is_err());
        assert!(validate_mobile("phone").is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_contact_type() {
        let (directory, _) = setup(false).await;
        let mut request = create_request("u1");
        request.enabled_contact_types.push("pigeon".to_string());
        let err = directory.create_receiver(request).await.unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)));
    }

    #[tokio::test]
    async fn test_implicit_verify_is_opt_in() {
        let (directory, _) = setup(false).await;
        let created = directory.create_receiver(create_request("u1")).await.unwrap();
        assert!(created.receiver.enabled_email);
        assert!(!created.receiver.verified_email);

        let (directory, _) = setup(true).await;
        let created = directory.create_receiver(create_request("u1")).await.unwrap();
        assert!(created.receiver.verified_email);
        // Mobile is not enabled, so it stays unverified.
        assert!(!created.receiver.verified_mobile);
    }

    #[tokio::test]
    async fn test_email_change_clears_verification() {
        let (directory, _) = setup(true).await;
        directory.create_receiver(create_request("u1")).await.unwrap();
        directory
            .pull_sub_contacts("u1", &["dingtalk".to_string()])
            .await
            .unwrap();

        let updated = directory
            .update_receiver(
                "u1",
                ReceiverUpdate {
                    email: Some("new@b.c".to_string()),
                    mobile: Some("13900000000".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.receiver.verified_email);
        let ding = updated.sub_contact("dingtalk").unwrap();
        assert!(!ding.verified);
        assert_eq!(ding.verified_note, MOBILE_CHANGED_NOTE);
    }

    #[tokio::test]
    async fn test_sync_revives_deleted_receiver() {
        let (directory, identity) = setup(false).await;
        let user = IdentityUser {
            id: "u9".to_string(),
            name: "carol".to_string(),
            domain_id: "D1".to_string(),
            email: "carol@example.com".to_string(),
            ..Default::default()
        };
        identity.add_user(user.clone());
        directory.sync_user(&user).await.unwrap().unwrap();
        directory
            .pull_sub_contacts("u9", &["dingtalk".to_string()])
            .await
            .unwrap();
        directory.delete_receiver("u9").await.unwrap();

        let revived = directory.sync_by_ident("u9").await.unwrap().unwrap();
        assert!(!revived.receiver.deleted);
        assert_eq!(revived.receiver.email, "carol@example.com");
        assert!(revived.sub_contacts.is_empty());
        assert_eq!(directory.get("u9").await.unwrap().receiver.name, "carol");
    }

    #[tokio::test]
    async fn test_pull_sub_contacts() {
        let (directory, _) = setup(false).await;
        directory.create_receiver(create_request("u1")).await.unwrap();
        let mut other = create_request("u2");
        other.mobile = "13900000000".to_string();
        directory.create_receiver(other).await.unwrap();

        let resolved = directory
            .pull_sub_contacts("u1", &["dingtalk".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved, vec!["dingtalk".to_string()]);
        let u1 = directory.get("u1").await.unwrap();
        let ding = u1.sub_contact("dingtalk").unwrap();
        assert_eq!(ding.contact, "ding-u1");
        assert!(ding.verified && ding.enabled);
        assert_eq!(ding.parent_contact_type, MOBILE);

        let resolved = directory
            .pull_sub_contacts("u2", &["dingtalk".to_string()])
            .await
            .unwrap();
        assert!(resolved.is_empty());
        let u2 = directory.get("u2").await.unwrap();
        let ding = u2.sub_contact("dingtalk").unwrap();
        assert!(!ding.verified);
        assert!(ding.verified_note.contains("not found"));
    }

    #[tokio::test]
    async fn test_eligibility_order() {
        let (directory, _) = setup(false).await;
        let mut details = directory.create_receiver(create_request("u1")).await.unwrap();
        let email_caps = Capabilities {
            is_personal: true,
            ..Default::default()
        };

        let err = details.eligible_contact(EMAIL, email_caps).unwrap_err();
        assert!(err.to_string().contains("not verified"));
        let err = details.eligible_contact(MOBILE, email_caps).unwrap_err();
        assert!(err.to_string().contains("not enabled"));

        details.receiver.verified_email = true;
        assert_eq!(details.eligible_contact(EMAIL, email_caps).unwrap(), "a@b.c");

        details.receiver.email.clear();
        let err = details.eligible_contact(EMAIL, email_caps).unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)));

        details.receiver.enabled = false;
        let err = details.eligible_contact(EMAIL, email_caps).unwrap_err();
        assert!(err.to_string().contains("disabled"));

        // System-config channels are implicitly enabled and verified.
        details.receiver.enabled = true;
        let console = Capabilities {
            is_personal: true,
            is_system_config: true,
            ..Default::default()
        };
        assert_eq!(details.eligible_contact("webconsole", console).unwrap(), "u1");
    }

    #[tokio::test]
    async fn test_sync_user_and_watch_events() {
        let (directory, _) = setup(false).await;
        let user = IdentityUser {
            id: "u9".to_string(),
            name: "nine".to_string(),
            domain_id: "D1".to_string(),
            email: "nine@b.c".to_string(),
            ..Default::default()
        };
        let synced = directory.sync_user(&user).await.unwrap().unwrap();
        assert!(synced.receiver.enabled_email);
        assert!(!synced.receiver.verified_email);

        let system = IdentityUser {
            id: "sys".to_string(),
            email: "sys@b.c".to_string(),
            is_system_account: true,
            ..Default::default()
        };
        assert!(directory.sync_user(&system).await.unwrap().is_none());

        let renamed = IdentityUser {
            name: "renamed".to_string(),
            lang: "zh".to_string(),
            ..user.clone()
        };
        directory.on_update(&renamed).await.unwrap();
        let details = directory.get("u9").await.unwrap();
        assert_eq!(details.receiver.name, "renamed");
        assert_eq!(details.receiver.lang, "zh");

        directory.on_delete("u9").await.unwrap();
        assert!(directory.get("u9").await.is_err());
        assert!(directory.find("u9").await.unwrap().is_none());
    }
}
