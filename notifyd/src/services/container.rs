//! Service container for dependency injection.
//!
//! The ServiceContainer builds every process-scoped service once, wires
//! them together and owns the background loops and their shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::AppConfig;
use crate::credentials::{ConfigService, FileTokenStore, TokenCache};
use crate::database::MaintenanceScheduler;
use crate::database::repositories::{
    ConfigRepository, NotificationRepository, ReceiverRepository, RobotRepository,
    SqlxConfigRepository, SqlxNotificationRepository, SqlxReceiverRepository,
    SqlxRobotRepository, SqlxSubscriberRepository, SqlxTemplateRepository,
    SqlxTopicRepository, SqlxVerificationRepository, SubscriberRepository, TemplateRepository,
    TopicRepository,
};
use crate::identity::{IdentityClient, StaticIdentityClient};
use crate::notification::channels::{
    DingtalkDriver, DriverFilter, DriverRegistry, EmailDriver, FeishuDriver, MobileDriver,
    RobotDriver, RobotKind, WebconsoleDriver, WebhookDriver, WebsocketDriver, WorkwxDriver,
};
use crate::notification::{Dispatcher, RetryScheduler};
use crate::receiver::{ReceiverDirectory, RobotService};
use crate::subscriber::{SubscriberResolver, SubscriberService};
use crate::template::{SeedReport, TemplateSeeder, TemplateStore};
use crate::topic::{TopicRegistry, TopicService};
use crate::utils::http_client::build_client;
use crate::verification::VerificationManager;

/// Default vendor HTTP timeout.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default in-app broadcast capacity.
const DEFAULT_IN_APP_CAPACITY: usize = 256;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared pieces drivers are built from.
pub struct DriverContext {
    pub client: Client,
    pub token_cache: Arc<TokenCache>,
    pub file_store: Arc<FileTokenStore>,
    pub webconsole: Arc<WebconsoleDriver>,
    pub ssl_global: bool,
    pub email_timeout: Duration,
}

/// Register every built-in channel driver.
pub fn default_drivers(ctx: &DriverContext) -> Result<DriverRegistry> {
    let mut drivers = DriverRegistry::new();
    drivers
        .register(Arc::new(EmailDriver::new(
            ctx.token_cache.clone(),
            ctx.ssl_global,
            ctx.email_timeout,
        )))
        .register(Arc::new(MobileDriver::new(ctx.client.clone(), ctx.token_cache.clone())))
        .register(Arc::new(DingtalkDriver::new(ctx.client.clone(), ctx.token_cache.clone())))
        .register(Arc::new(FeishuDriver::new(
            ctx.client.clone(),
            ctx.token_cache.clone(),
            ctx.file_store.clone(),
        )))
        .register(Arc::new(WorkwxDriver::new(ctx.client.clone(), ctx.token_cache.clone())))
        .register(Arc::new(RobotDriver::new(RobotKind::Dingtalk, ctx.client.clone())))
        .register(Arc::new(RobotDriver::new(RobotKind::Feishu, ctx.client.clone())))
        .register(Arc::new(RobotDriver::new(RobotKind::Workwx, ctx.client.clone())))
        .register(Arc::new(WebhookDriver::new(ctx.client.clone())))
        .register(Arc::new(WebsocketDriver::new(ctx.client.clone(), ctx.token_cache.clone())))
        .register(ctx.webconsole.clone());
    Ok(drivers)
}

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    pub config: AppConfig,
    pub drivers: Arc<DriverRegistry>,
    pub token_cache: Arc<TokenCache>,
    /// In-app message stream for the websocket surface.
    pub webconsole: Arc<WebconsoleDriver>,
    pub config_service: Arc<ConfigService>,
    pub topics: Arc<TopicService>,
    pub templates: Arc<TemplateStore>,
    pub receivers: Arc<ReceiverDirectory>,
    pub robots: Arc<RobotService>,
    pub subscribers: Arc<SubscriberService>,
    pub resolver: Arc<SubscriberResolver>,
    pub dispatcher: Arc<Dispatcher>,
    pub verification: Arc<VerificationManager>,
    pub retry_scheduler: Arc<RetryScheduler>,
    pub maintenance: Arc<MaintenanceScheduler>,
    template_repo: Arc<dyn TemplateRepository>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create a container with the built-in drivers and an in-memory
    /// identity backend.
    pub fn new(pool: SqlitePool, config: AppConfig) -> Result<Self> {
        Self::with_parts(
            pool,
            config,
            Arc::new(StaticIdentityClient::new()),
            default_drivers,
        )
    }

    /// Create a container with a custom identity backend and driver set.
    pub fn with_parts<F>(
        pool: SqlitePool,
        config: AppConfig,
        identity: Arc<dyn IdentityClient>,
        build_drivers: F,
    ) -> Result<Self>
    where
        F: FnOnce(&DriverContext) -> Result<DriverRegistry>,
    {
        info!("Initializing service container");

        // Create repositories
        let config_repo: Arc<dyn ConfigRepository> =
            Arc::new(SqlxConfigRepository::new(pool.clone()));
        let notification_repo: Arc<dyn NotificationRepository> =
            Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let receiver_repo: Arc<dyn ReceiverRepository> =
            Arc::new(SqlxReceiverRepository::new(pool.clone()));
        let robot_repo: Arc<dyn RobotRepository> = Arc::new(SqlxRobotRepository::new(pool.clone()));
        let subscriber_repo: Arc<dyn SubscriberRepository> =
            Arc::new(SqlxSubscriberRepository::new(pool.clone()));
        let template_repo: Arc<dyn TemplateRepository> =
            Arc::new(SqlxTemplateRepository::new(pool.clone()));
        let topic_repo: Arc<dyn TopicRepository> = Arc::new(SqlxTopicRepository::new(pool.clone()));
        let verification_repo = Arc::new(SqlxVerificationRepository::new(pool.clone()));

        // Credentials and drivers
        let token_cache = Arc::new(TokenCache::new(config_repo.clone()));
        let webconsole = Arc::new(WebconsoleDriver::new(DEFAULT_IN_APP_CAPACITY));
        let ctx = DriverContext {
            client: build_client(DEFAULT_HTTP_TIMEOUT),
            token_cache: token_cache.clone(),
            file_store: Arc::new(FileTokenStore::new(config.token_cache_dir.clone())),
            webconsole: webconsole.clone(),
            ssl_global: config.ssl_global,
            email_timeout: config.dispatch.email_timeout,
        };
        let drivers = Arc::new(build_drivers(&ctx)?);
        debug!(drivers = ?drivers.names(DriverFilter::All), "Channel drivers registered");

        let config_service = Arc::new(ConfigService::new(
            config_repo.clone(),
            drivers.clone(),
            token_cache.clone(),
        ));

        // Topics and templates
        let registry = Arc::new(TopicRegistry::with_builtins()?);
        let topics = Arc::new(TopicService::new(topic_repo.clone(), registry));
        let templates = Arc::new(TemplateStore::new(
            template_repo.clone(),
            config.template.default_lang.clone(),
        ));

        // Recipients
        let receivers = Arc::new(ReceiverDirectory::new(
            receiver_repo.clone(),
            subscriber_repo.clone(),
            drivers.clone(),
            identity.clone(),
            config.receiver.clone(),
        ));
        let robots = Arc::new(RobotService::new(
            robot_repo.clone(),
            subscriber_repo.clone(),
            drivers.clone(),
        ));
        let subscribers = Arc::new(SubscriberService::new(
            subscriber_repo.clone(),
            topic_repo,
            receiver_repo,
            robot_repo.clone(),
        ));
        let resolver = Arc::new(SubscriberResolver::new(
            topics.clone(),
            subscriber_repo,
            robot_repo.clone(),
            identity,
        ));

        // Create cancellation token for graceful shutdown
        let cancellation_token = CancellationToken::new();

        // Dispatch
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            config.template.brand.clone(),
            drivers.clone(),
            notification_repo.clone(),
            receivers.clone(),
            robot_repo,
            config_repo,
            templates.clone(),
            resolver.clone(),
            cancellation_token.child_token(),
        ));
        let verification = Arc::new(VerificationManager::new(
            verification_repo,
            receivers.clone(),
            drivers.clone(),
            templates.clone(),
            config.verification.clone(),
            config.template.brand.clone(),
        ));
        let retry_scheduler = Arc::new(RetryScheduler::new(
            dispatcher.clone(),
            notification_repo,
            config.dispatch.clone(),
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            pool.clone(),
            config.maintenance.clone(),
        ));

        info!("Service container initialized");

        Ok(Self {
            pool,
            config,
            drivers,
            token_cache,
            webconsole,
            config_service,
            topics,
            templates,
            receivers,
            robots,
            subscribers,
            resolver,
            dispatcher,
            verification,
            retry_scheduler,
            maintenance,
            template_repo,
            tasks: Mutex::new(Vec::new()),
            cancellation_token,
        })
    }

    /// Insert default topics and load templates from disk.
    pub async fn seed(&self) -> Result<SeedReport> {
        let topics = self.topics.seed_default_topics().await?;
        info!("Seeded {} default topics", topics);

        let seeder = TemplateSeeder::new(self.template_repo.clone(), self.config.template.clone());
        let report = seeder.seed().await?;
        info!(
            created = report.created,
            replaced_topics = report.replaced_topics,
            duplicates_removed = report.duplicates_removed,
            langs_filled = report.langs_filled,
            "Templates seeded"
        );
        Ok(report)
    }

    /// Start the retry, maintenance and identity-watch loops.
    pub fn start(&self) {
        info!("Starting background services");
        let mut tasks = self.tasks.lock();

        tasks.push(
            self.retry_scheduler
                .clone()
                .start(self.cancellation_token.child_token()),
        );
        info!("Retry scheduler started");

        tasks.push(
            self.maintenance
                .clone()
                .start(self.cancellation_token.child_token()),
        );
        info!("Maintenance scheduler started");

        match self
            .receivers
            .start_watch(self.cancellation_token.child_token())
        {
            Some(handle) => {
                tasks.push(handle);
                info!("Identity watch started");
            }
            None => debug!("Identity backend does not support watching"),
        }
    }

    /// Cancel background loops and wait for them to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            match tokio::time::timeout(DEFAULT_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task ended abnormally: {}", e),
                Err(_) => warn!("Background task did not stop within {:?}", DEFAULT_SHUTDOWN_TIMEOUT),
            }
        }
        info!("Services shut down");
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;
    use crate::notification::channels::{DINGTALK, EMAIL, WEBCONSOLE, WEBHOOK};

    fn config(dir: &tempfile::TempDir) -> AppConfig {
        AppConfig {
            token_cache_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_default_drivers_registered() {
        let dir = tempfile::tempdir().unwrap();
        let container = ServiceContainer::new(test_pool().await, config(&dir)).unwrap();
        for channel in [EMAIL, DINGTALK, WEBCONSOLE] {
            assert!(container.drivers.contains(channel), "{channel} missing");
        }
        let robots = container.drivers.names(DriverFilter::Robot);
        assert_eq!(robots.len(), 4);
        assert!(robots.contains(&WEBHOOK));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let container = ServiceContainer::new(test_pool().await, config(&dir)).unwrap();
        container.start();
        assert!(!container.cancellation_token().is_cancelled());
        container.shutdown().await;
        assert!(container.cancellation_token().is_cancelled());
        assert!(!container.retry_scheduler.is_running());
    }
}
