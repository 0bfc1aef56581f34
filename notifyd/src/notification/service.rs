//! The dispatch engine.
//!
//! A notification moves `received -> sending -> {ok, part_ok, failed}`;
//! each of its delivery rows moves `received -> sent -> {ok, fail}`. Rows
//! are written before and after every driver call, so a crash between the
//! two leaves a `sent` row that the retry scheduler sends again.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DispatchConfig;
use super::channels::{
    Capabilities, ChannelDriver, DriverFilter, DriverRegistry, MOBILE, Recipient, SendParams,
    WEBCONSOLE, WEBHOOK,
};
use crate::database::models::{
    NotificationDbModel, NotificationPriority, NotificationStatus, ReceiverNotificationDbModel,
    RecipientStatus, RecipientType, SYSTEM_DOMAIN_ID, TopicDbModel, roll_up,
};
use crate::database::repositories::{
    ConfigRepository, DeliveryOutcome, NotificationRepository, RobotRepository,
};
use crate::error::ErrorKind;
use crate::receiver::ReceiverDirectory;
use crate::subscriber::SubscriberResolver;
use crate::template::{RenderedContent, TemplateStore};
use crate::utils::json::parse_object;
use crate::{Error, Result};

/// A validated direct-send request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationCreate {
    pub channel: String,
    pub topic: String,
    pub priority: NotificationPriority,
    pub message: String,
    /// Receiver ids or names.
    pub receivers: Vec<String>,
    pub robots: Vec<String>,
    /// Raw contacts without a receiver record.
    pub contacts: Vec<String>,
    pub tag: String,
    pub ignore_nonexistent_receiver: bool,
}

/// A resource event as emitted by other services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventNotify {
    pub resource_type: String,
    pub action: String,
    pub advance_days: i64,
    pub project_domain_id: String,
    pub project_id: String,
    pub resource_details: Value,
    pub priority: NotificationPriority,
    /// Personal channels to use instead of every configured one.
    pub contact_types: Vec<String>,
}

impl EventNotify {
    pub fn event_name(&self) -> String {
        format!("{}/{}", self.resource_type, self.action)
    }

    /// Payload for personal channels: the resource details, plus the event
    /// coordinates where the details lack them.
    fn personal_message(&self) -> String {
        let mut map = match &self.resource_details {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => Map::from_iter([("resource_details".to_string(), other.clone())]),
        };
        map.entry("resource_type")
            .or_insert_with(|| Value::String(self.resource_type.clone()));
        map.entry("action")
            .or_insert_with(|| Value::String(self.action.clone()));
        Value::Object(map).to_string()
    }

    fn webhook_message(&self) -> String {
        json!({
            "resource_type": self.resource_type,
            "action": self.action,
            "resource_details": self.resource_details,
        })
        .to_string()
    }
}

/// Free-form subject and body for explicit receivers, role holders and
/// robots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactNotify {
    pub subject: String,
    pub body: String,
    /// Receiver ids or names.
    pub receiver_ids: Vec<String>,
    /// Every user holding one of these roles is added as a receiver.
    pub role_ids: Vec<String>,
    pub robot_ids: Vec<String>,
    pub contact_types: Vec<String>,
    pub priority: NotificationPriority,
}

/// `event` value of notifications created by [`Dispatcher::contact_notify`].
const CONTACT_EVENT: &str = "contact";

/// One channel that could not be notified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedElem {
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventNotifyResult {
    pub notification_ids: Vec<String>,
    pub failed: Vec<FailedElem>,
}

/// Extra request shape carried by robot deliveries.
#[derive(Debug, Clone, Default)]
struct RobotExtras {
    header: HashMap<String, String>,
    body: Map<String, Value>,
    msg_key: String,
}

/// One eligible delivery row, resolved to its contact.
#[derive(Debug, Clone)]
struct Delivery {
    row_id: String,
    contact: String,
    domain_id: String,
    lang: String,
    robot: Option<RobotExtras>,
}

/// Removes the notification from the running set when dropped.
struct RunningGuard<'a> {
    running: &'a DashSet<String>,
    id: String,
}

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a DashSet<String>, id: &str) -> Option<Self> {
        running.insert(id.to_string()).then(|| Self {
            running,
            id: id.to_string(),
        })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

/// Insert a `brand` field into JSON-object payloads lacking one.
fn with_brand(message: &str, brand: &str) -> String {
    match parse_object(message) {
        Some(mut map) if !map.contains_key("brand") && !brand.is_empty() => {
            map.insert("brand".to_string(), Value::String(brand.to_string()));
            Value::Object(map).to_string()
        }
        _ => message.to_string(),
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    brand: String,
    drivers: Arc<DriverRegistry>,
    notifications: Arc<dyn NotificationRepository>,
    receivers: Arc<ReceiverDirectory>,
    robots: Arc<dyn RobotRepository>,
    configs: Arc<dyn ConfigRepository>,
    templates: Arc<TemplateStore>,
    resolver: Arc<SubscriberResolver>,
    workers: Arc<Semaphore>,
    running: DashSet<String>,
    cancel: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatchConfig,
        brand: impl Into<String>,
        drivers: Arc<DriverRegistry>,
        notifications: Arc<dyn NotificationRepository>,
        receivers: Arc<ReceiverDirectory>,
        robots: Arc<dyn RobotRepository>,
        configs: Arc<dyn ConfigRepository>,
        templates: Arc<TemplateStore>,
        resolver: Arc<SubscriberResolver>,
        cancel: CancellationToken,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_count.max(1)));
        Self {
            config,
            brand: brand.into(),
            drivers,
            notifications,
            receivers,
            robots,
            configs,
            templates,
            resolver,
            workers,
            running: DashSet::new(),
            cancel,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Create a notification for explicit targets and dispatch it in the
    /// background. Returns the notification id.
    pub async fn send(self: &Arc<Self>, request: NotificationCreate) -> Result<String> {
        let driver = self.drivers.get(&request.channel)?;
        if request.message.is_empty() {
            return Err(Error::input_invalid("message is required"));
        }

        let mut notification = NotificationDbModel::new(
            &request.topic,
            &request.channel,
            request.priority,
            &request.message,
        );
        notification.tag = request.tag.clone();

        let mut rows = Vec::new();
        let mut receiver_ids = BTreeSet::new();
        for ident in &request.receivers {
            match self.lookup_receiver(ident).await? {
                Some(id) => {
                    receiver_ids.insert(id);
                }
                None if request.ignore_nonexistent_receiver => {
                    debug!(receiver = %ident, "Ignoring unknown receiver");
                }
                None => {
                    return Err(Error::input_invalid(format!("receiver '{}' not found", ident)));
                }
            }
        }
        rows.extend(receiver_ids.into_iter().map(|id| {
            ReceiverNotificationDbModel::new(&notification.id, RecipientType::Receiver, id)
        }));

        let robot_ids: BTreeSet<&String> = request.robots.iter().collect();
        for id in robot_ids {
            let robot = match self.robots.get_robot(id).await {
                Ok(robot) => robot,
                Err(e) if e.kind() == ErrorKind::NotFound && request.ignore_nonexistent_receiver => {
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::input_invalid(format!("robot '{}' not found", id)));
                }
                Err(e) => return Err(e),
            };
            if robot.robot_type != request.channel {
                return Err(Error::input_invalid(format!(
                    "robot '{}' is a {} robot, not {}",
                    robot.name, robot.robot_type, request.channel
                )));
            }
            rows.push(ReceiverNotificationDbModel::new(
                &notification.id,
                RecipientType::Robot,
                robot.id,
            ));
        }

        let contacts: BTreeSet<&str> = request
            .contacts
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        rows.extend(
            contacts
                .into_iter()
                .map(|c| ReceiverNotificationDbModel::for_contact(&notification.id, c)),
        );

        if rows.is_empty() {
            return Err(Error::input_invalid("no valid receivers"));
        }

        self.notifications
            .create_notification(&notification, &rows)
            .await?;
        info!(
            notification_id = %notification.id,
            channel = driver.channel_type(),
            recipients = rows.len(),
            "Notification created"
        );
        self.spawn_run(notification.id.clone());
        Ok(notification.id)
    }

    /// Fan a resource event out to every channel of its topic's recipients.
    ///
    /// One notification is created per personal channel configured for the
    /// project domain, one for the in-app console, and one per robot type.
    /// A failing channel is reported without aborting the others.
    pub async fn event_notify(self: &Arc<Self>, event: EventNotify) -> Result<EventNotifyResult> {
        let event_name = event.event_name();
        let mut topics = self
            .resolver
            .matching_topics(&event.resource_type, &event.action, event.advance_days)
            .await?;
        if topics.len() > 1 {
            return Err(Error::Duplicate(format!(
                "{} topics match event {}",
                topics.len(),
                event_name
            )));
        }
        let topic = topics
            .pop()
            .ok_or_else(|| Error::not_found("Topic", &event_name))?;

        let recipients = self
            .resolver
            .resolve_topic(&topic.id, &event.project_domain_id, &event.project_id)
            .await?;
        let mut result = EventNotifyResult::default();

        if !recipients.receiver_ids.is_empty() {
            for id in &recipients.receiver_ids {
                if let Err(e) = self.lookup_receiver(id).await {
                    warn!(receiver_id = %id, error = %e, "Receiver sync failed");
                }
            }

            let mut channels: Vec<String> = if event.contact_types.is_empty() {
                self.personal_channels(&event.project_domain_id)
                    .await?
                    .into_iter()
                    .map(String::from)
                    .collect()
            } else {
                event
                    .contact_types
                    .iter()
                    .filter(|c| c.as_str() != MOBILE && c.as_str() != WEBCONSOLE)
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            };
            if !topic.webconsole_disable && self.drivers.contains(WEBCONSOLE) {
                channels.push(WEBCONSOLE.to_string());
            }
            let message = event.personal_message();
            for channel in &channels {
                let outcome = if !self.drivers.contains(channel) {
                    Err(Error::NotSupported(format!("no driver for '{}'", channel)))
                } else {
                    self.create_event_notification(
                        &topic,
                        &event,
                        channel,
                        &message,
                        RecipientType::Receiver,
                        &recipients.receiver_ids,
                    )
                    .await
                };
                collect(&mut result, channel, outcome);
            }
        }

        if !recipients.robot_ids.is_empty() {
            let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for robot in self.robots.list_by_ids(&recipients.robot_ids).await? {
                by_type.entry(robot.robot_type).or_default().push(robot.id);
            }
            for (robot_type, ids) in by_type {
                let outcome = if !self.drivers.contains(&robot_type) {
                    Err(Error::NotSupported(format!("no driver for '{}'", robot_type)))
                } else {
                    let message = if robot_type == WEBHOOK {
                        event.webhook_message()
                    } else {
                        event.personal_message()
                    };
                    self.create_event_notification(
                        &topic,
                        &event,
                        &robot_type,
                        &message,
                        RecipientType::Robot,
                        &ids,
                    )
                    .await
                };
                collect(&mut result, &robot_type, outcome);
            }
        }

        for id in &result.notification_ids {
            self.spawn_run(id.clone());
        }
        info!(
            event = %event_name,
            topic = %topic.name,
            notifications = result.notification_ids.len(),
            failed = result.failed.len(),
            "Event dispatched"
        );
        Ok(result)
    }

    async fn create_event_notification(
        &self,
        topic: &TopicDbModel,
        event: &EventNotify,
        channel: &str,
        message: &str,
        recipient_type: RecipientType,
        ids: &[String],
    ) -> Result<String> {
        let mut notification =
            NotificationDbModel::new(&topic.name, channel, event.priority, message);
        notification.topic_type = topic.topic_type.clone();
        notification.event = event.event_name();
        self.create_for(notification, recipient_type, ids).await
    }

    async fn create_for(
        &self,
        notification: NotificationDbModel,
        recipient_type: RecipientType,
        ids: &[String],
    ) -> Result<String> {
        let rows: Vec<_> = ids
            .iter()
            .map(|id| ReceiverNotificationDbModel::new(&notification.id, recipient_type, id))
            .collect();
        self.notifications
            .create_notification(&notification, &rows)
            .await?;
        Ok(notification.id)
    }

    /// Deliver a subject and body on the requested channels.
    ///
    /// Receivers are the given ids plus every holder of the given roles;
    /// each channel only reaches receivers that enabled it. Robots get one
    /// notification per robot type. Unknown receivers are skipped.
    pub async fn contact_notify(
        self: &Arc<Self>,
        request: ContactNotify,
    ) -> Result<EventNotifyResult> {
        if request.body.is_empty() {
            return Err(Error::input_invalid("body is required"));
        }

        let mut idents: BTreeSet<String> = request.receiver_ids.iter().cloned().collect();
        idents.extend(self.resolver.expand_role_members(&request.role_ids).await);

        let mut receivers = BTreeMap::new();
        for ident in &idents {
            let id = match self.lookup_receiver(ident).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!(receiver = %ident, "Skipping unknown receiver");
                    continue;
                }
                Err(e) => {
                    warn!(receiver = %ident, error = %e, "Receiver lookup failed");
                    continue;
                }
            };
            let details = self.receivers.get(&id).await?;
            if details.receiver.enabled {
                receivers.insert(id, details.enabled_contact_types());
            }
        }

        let mut result = EventNotifyResult::default();
        let contact_types: BTreeSet<&str> =
            request.contact_types.iter().map(String::as_str).collect();
        for channel in contact_types {
            let ids: Vec<String> = receivers
                .iter()
                .filter(|(_, enabled)| {
                    channel == WEBCONSOLE || enabled.iter().any(|c| c == channel)
                })
                .map(|(id, _)| id.clone())
                .collect();
            if ids.is_empty() {
                continue;
            }
            let outcome = if !self.drivers.contains(channel) {
                Err(Error::NotSupported(format!("no driver for '{}'", channel)))
            } else {
                let notification = self.contact_model(&request, channel);
                self.create_for(notification, RecipientType::Receiver, &ids)
                    .await
            };
            collect(&mut result, channel, outcome);
        }

        if !request.robot_ids.is_empty() {
            let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for robot in self.robots.list_by_ids(&request.robot_ids).await? {
                by_type.entry(robot.robot_type).or_default().push(robot.id);
            }
            for (robot_type, ids) in by_type {
                let outcome = if !self.drivers.contains(&robot_type) {
                    Err(Error::NotSupported(format!("no driver for '{}'", robot_type)))
                } else {
                    let notification = self.contact_model(&request, &robot_type);
                    self.create_for(notification, RecipientType::Robot, &ids)
                        .await
                };
                collect(&mut result, &robot_type, outcome);
            }
        }

        for id in &result.notification_ids {
            self.spawn_run(id.clone());
        }
        info!(
            subject = %request.subject,
            notifications = result.notification_ids.len(),
            failed = result.failed.len(),
            "Contact notification dispatched"
        );
        Ok(result)
    }

    fn contact_model(&self, request: &ContactNotify, channel: &str) -> NotificationDbModel {
        let mut notification =
            NotificationDbModel::new(&request.subject, channel, request.priority, &request.body);
        notification.event = CONTACT_EVENT.to_string();
        notification
    }

    /// Personal channels with a usable config for `domain_id`. SMS needs a
    /// vendor template and is left to direct sends.
    async fn personal_channels(&self, domain_id: &str) -> Result<Vec<&'static str>> {
        let configured = self.configs.list_configured_channels(domain_id).await?;
        Ok(self
            .drivers
            .names(DriverFilter::PersonalValid)
            .into_iter()
            .filter(|c| *c != MOBILE && *c != WEBCONSOLE)
            .filter(|c| configured.iter().any(|x| x == c))
            .collect())
    }

    /// Receiver id for an id or name, syncing it from the identity service
    /// on first sight.
    async fn lookup_receiver(&self, ident: &str) -> Result<Option<String>> {
        if let Some(details) = self.receivers.find(ident).await? {
            return Ok(Some(details.receiver.id));
        }
        match self.receivers.sync_by_ident(ident).await {
            Ok(details) => Ok(details.map(|d| d.receiver.id)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn spawn_run(self: &Arc<Self>, notification_id: String) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run(&notification_id).await {
                error!(notification_id = %notification_id, error = %e, "Dispatch failed");
            }
        });
    }

    /// Deliver every row of the notification that is not yet `ok` and did
    /// not fail terminally, then roll the status up.
    ///
    /// Concurrent runs of the same notification are collapsed: the second
    /// caller returns `sending` without touching any row.
    pub async fn run(self: &Arc<Self>, notification_id: &str) -> Result<NotificationStatus> {
        let Some(_guard) = RunningGuard::acquire(&self.running, notification_id) else {
            debug!(notification_id, "Notification already being dispatched");
            return Ok(NotificationStatus::Sending);
        };

        let notification = self.notifications.get_notification(notification_id).await?;
        let attempt = self.notifications.begin_attempt(notification_id).await?;
        let rows = self.notifications.list_receiver_rows(notification_id).await?;
        debug!(
            notification_id,
            channel = %notification.channel,
            attempt,
            rows = rows.len(),
            "Dispatching notification"
        );

        let pending: Vec<_> = rows.into_iter().filter(needs_delivery).collect();
        match self.drivers.get(&notification.channel) {
            Ok(driver) => self.deliver(&notification, driver, pending).await?,
            Err(e) => {
                for row in &pending {
                    self.notifications
                        .record_outcome(&row.id, &DeliveryOutcome::failed(&e))
                        .await?;
                }
            }
        }
        self.finish(notification_id).await
    }

    async fn deliver(
        self: &Arc<Self>,
        notification: &NotificationDbModel,
        driver: Arc<dyn ChannelDriver>,
        rows: Vec<ReceiverNotificationDbModel>,
    ) -> Result<()> {
        let caps = driver.capabilities();

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.plan(row, &notification.channel, caps).await {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => {
                    debug!(
                        notification_id = %notification.id,
                        receiver_id = %row.receiver_id,
                        reason = %e,
                        "Recipient skipped"
                    );
                    self.notifications
                        .record_outcome(&row.id, &DeliveryOutcome::failed(&e))
                        .await?;
                }
            }
        }

        let mut rendered: HashMap<String, RenderedContent> = HashMap::new();
        let mut ready = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            if !rendered.contains_key(&delivery.lang) {
                match self.render(notification, &delivery.lang, caps).await {
                    Ok(content) => {
                        rendered.insert(delivery.lang.clone(), content);
                    }
                    Err(e) => {
                        self.notifications
                            .record_outcome(&delivery.row_id, &DeliveryOutcome::failed(&e))
                            .await?;
                        continue;
                    }
                }
            }
            ready.push(delivery);
        }

        let remote_param = parse_object(&notification.message);
        let base = |content: &RenderedContent| SendParams {
            topic: notification.topic.clone(),
            title: content.title.clone(),
            message: content.message.clone(),
            remote_template: content.remote_template.clone(),
            remote_template_param: remote_param.clone(),
            priority: notification.priority(),
            event: notification.event.clone(),
            ..Default::default()
        };
        let timeout = driver.timeout().unwrap_or(self.config.send_timeout);

        let mut tasks = JoinSet::new();
        if driver.supports_batch() {
            let mut groups: BTreeMap<(String, String), Vec<Delivery>> = BTreeMap::new();
            for delivery in ready {
                groups
                    .entry((delivery.domain_id.clone(), delivery.lang.clone()))
                    .or_default()
                    .push(delivery);
            }
            for ((_, lang), group) in groups {
                let Some(content) = rendered.get(&lang) else {
                    continue;
                };
                let mut params = base(content);
                params.receivers = group
                    .iter()
                    .map(|d| Recipient::new(&d.contact, &d.domain_id))
                    .collect();
                let dispatcher = self.clone();
                let driver = driver.clone();
                tasks.spawn(async move {
                    dispatcher.send_group(driver, params, group, timeout).await;
                });
            }
        } else {
            for delivery in ready {
                let Some(content) = rendered.get(&delivery.lang) else {
                    continue;
                };
                let mut params = base(content);
                params.receivers = vec![Recipient::new(&delivery.contact, &delivery.domain_id)];
                if let Some(extras) = &delivery.robot {
                    params.header = extras.header.clone();
                    params.body = extras.body.clone();
                    params.msg_key = extras.msg_key.clone();
                }
                let dispatcher = self.clone();
                let driver = driver.clone();
                tasks.spawn(async move {
                    dispatcher.send_group(driver, params, vec![delivery], timeout).await;
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(notification_id = %notification.id, error = %e, "Delivery task panicked");
            }
        }
        Ok(())
    }

    /// Send to a group of rows with one driver call and record each outcome.
    async fn send_group(
        &self,
        driver: Arc<dyn ChannelDriver>,
        params: SendParams,
        group: Vec<Delivery>,
        timeout: Duration,
    ) {
        // Cancelled before a worker freed up: rows stay as they are.
        let Some(_permit) = self.acquire_worker().await else {
            return;
        };

        // Rows stay `received` when this fails and the next pass picks them up.
        let marks: Vec<(String, String)> = group
            .iter()
            .map(|d| (d.row_id.clone(), d.contact.clone()))
            .collect();
        if let Err(e) = self.notifications.mark_sent(&marks, driver.channel_type()).await {
            warn!(rows = marks.len(), error = %e, "Failed to mark rows as sent");
            return;
        }

        let outcomes: Vec<DeliveryOutcome> = if group.len() == 1 {
            match self.bounded(timeout, driver.send(&params)).await {
                Ok(()) => vec![DeliveryOutcome::ok()],
                Err(e) => vec![DeliveryOutcome::failed(&e)],
            }
        } else {
            match self.bounded(timeout, driver.send_batch(&params)).await {
                Ok(failures) => {
                    let failed: HashMap<&str, &Error> = failures
                        .iter()
                        .map(|f| (f.contact.as_str(), &f.error))
                        .collect();
                    group
                        .iter()
                        .map(|d| match failed.get(d.contact.as_str()) {
                            Some(e) => DeliveryOutcome::failed(e),
                            None => DeliveryOutcome::ok(),
                        })
                        .collect()
                }
                Err(e) => group.iter().map(|_| DeliveryOutcome::failed(&e)).collect(),
            }
        };

        for (delivery, outcome) in group.iter().zip(outcomes.iter()) {
            if outcome.status == RecipientStatus::Fail {
                warn!(
                    channel = driver.channel_type(),
                    contact = %delivery.contact,
                    domain_id = %delivery.domain_id,
                    reason = %outcome.failed_reason,
                    "Delivery failed"
                );
            }
            if let Err(e) = self
                .notifications
                .record_outcome(&delivery.row_id, outcome)
                .await
            {
                error!(row_id = %delivery.row_id, error = %e, "Failed to record delivery outcome");
            }
        }
    }

    async fn acquire_worker(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            permit = self.workers.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Bound a driver call by the attempt deadline and the dispatch
    /// cancellation token.
    async fn bounded<T>(&self, timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Transient("dispatch cancelled".to_string())),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout),
            },
        }
    }

    /// Resolve a row to its contact, or the reason it cannot be delivered.
    async fn plan(
        &self,
        row: &ReceiverNotificationDbModel,
        channel: &str,
        caps: Capabilities,
    ) -> Result<Delivery> {
        match row.recipient_type() {
            RecipientType::Receiver => {
                let details = self.receivers.get(&row.receiver_id).await?;
                let contact = details.eligible_contact(channel, caps)?;
                Ok(Delivery {
                    row_id: row.id.clone(),
                    contact,
                    domain_id: details.receiver.domain_id,
                    lang: details.receiver.lang,
                    robot: None,
                })
            }
            RecipientType::Robot => {
                let robot = self.robots.get_robot(&row.receiver_id).await?;
                if !robot.enabled {
                    return Err(Error::Forbidden(format!("robot {} is disabled", robot.id)));
                }
                if robot.address.is_empty() {
                    return Err(Error::input_invalid(format!("robot {} has no address", robot.id)));
                }
                Ok(Delivery {
                    row_id: row.id.clone(),
                    robot: Some(RobotExtras {
                        header: robot.header_map(),
                        body: robot.body_map(),
                        msg_key: robot.msg_key.clone(),
                    }),
                    contact: robot.address,
                    domain_id: robot.domain_id,
                    lang: robot.lang,
                })
            }
            RecipientType::Contact => {
                if row.contact.is_empty() {
                    return Err(Error::input_invalid("empty contact"));
                }
                Ok(Delivery {
                    row_id: row.id.clone(),
                    contact: row.contact.clone(),
                    domain_id: SYSTEM_DOMAIN_ID.to_string(),
                    lang: String::new(),
                    robot: None,
                })
            }
        }
    }

    async fn render(
        &self,
        notification: &NotificationDbModel,
        lang: &str,
        caps: Capabilities,
    ) -> Result<RenderedContent> {
        // Webhook bodies and contact notifications carry the caller's text,
        // never a template.
        if notification.channel == WEBHOOK || notification.event == CONTACT_EVENT {
            return Ok(RenderedContent {
                title: notification.topic.clone(),
                message: notification.message.clone(),
                remote_template: None,
            });
        }
        let message = if caps.is_robot {
            notification.message.clone()
        } else {
            with_brand(&notification.message, &self.brand)
        };
        self.templates
            .render(&notification.topic, &notification.channel, lang, &message)
            .await
    }

    async fn finish(&self, notification_id: &str) -> Result<NotificationStatus> {
        let rows = self.notifications.list_receiver_rows(notification_id).await?;
        let status = roll_up(rows.iter().map(|r| r.status()));
        self.notifications.set_status(notification_id, status).await?;
        info!(notification_id, status = %status, rows = rows.len(), "Notification dispatched");
        Ok(status)
    }

    pub async fn get_notification(&self, id: &str) -> Result<NotificationDbModel> {
        self.notifications.get_notification(id).await
    }

    pub async fn list_receiver_notifications(
        &self,
        notification_id: &str,
    ) -> Result<Vec<ReceiverNotificationDbModel>> {
        self.notifications.list_receiver_rows(notification_id).await
    }

    pub async fn list_for_receiver(
        &self,
        receiver_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationDbModel>> {
        self.notifications.list_for_receiver(receiver_id, limit).await
    }
}

/// Rows still worth a driver call.
fn needs_delivery(row: &ReceiverNotificationDbModel) -> bool {
    match row.status() {
        RecipientStatus::Ok => false,
        RecipientStatus::Fail => !row
            .failed_kind
            .parse::<ErrorKind>()
            .is_ok_and(|k| k.is_terminal()),
        RecipientStatus::Received | RecipientStatus::Sent => true,
    }
}

fn collect(result: &mut EventNotifyResult, channel: &str, outcome: Result<String>) {
    match outcome {
        Ok(id) => result.notification_ids.push(id),
        Err(e) => {
            warn!(channel, error = %e, "Failed to create event notification");
            result.failed.push(FailedElem {
                channel: channel.to_string(),
                reason: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_brand() {
        assert_eq!(with_brand("plain", "Cloud"), "plain");
        let branded: Value = serde_json::from_str(&with_brand(r#"{"a":1}"#, "Cloud")).unwrap();
        assert_eq!(branded["brand"], "Cloud");
        let kept: Value =
            serde_json::from_str(&with_brand(r#"{"brand":"Own"}"#, "Cloud")).unwrap();
        assert_eq!(kept["brand"], "Own");
    }

    #[test]
    fn test_event_payloads() {
        let event = EventNotify {
            resource_type: "server".to_string(),
            action: "create".to_string(),
            resource_details: json!({"name": "vm1"}),
            ..Default::default()
        };
        assert_eq!(event.event_name(), "server/create");

        let personal: Value = serde_json::from_str(&event.personal_message()).unwrap();
        assert_eq!(personal["name"], "vm1");
        assert_eq!(personal["resource_type"], "server");

        let webhook: Value = serde_json::from_str(&event.webhook_message()).unwrap();
        assert_eq!(webhook["resource_details"]["name"], "vm1");
        assert_eq!(webhook["action"], "create");
    }

    #[test]
    fn test_needs_delivery() {
        let mut row = ReceiverNotificationDbModel::new("n1", RecipientType::Receiver, "u1");
        assert!(needs_delivery(&row));
        row.status = RecipientStatus::Ok.as_str().to_string();
        assert!(!needs_delivery(&row));
        row.status = RecipientStatus::Fail.as_str().to_string();
        row.failed_kind = ErrorKind::Timeout.to_string();
        assert!(needs_delivery(&row));
        row.failed_kind = ErrorKind::Forbidden.to_string();
        assert!(!needs_delivery(&row));
    }

    #[test]
    fn test_running_guard() {
        let running = DashSet::new();
        let guard = RunningGuard::acquire(&running, "n1");
        assert!(guard.is_some());
        assert!(RunningGuard::acquire(&running, "n1").is_none());
        drop(guard);
        assert!(RunningGuard::acquire(&running, "n1").is_some());
    }
}
