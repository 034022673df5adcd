use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use notify_scheduler::config::{ConfigurationSource, EnvConfigurationSource, SchedulerConfig};
use notify_scheduler::database::{self, SqlxJobInstanceStore};
use notify_scheduler::domain::DEFAULT_PARTITION_ATTRIBUTE;
use notify_scheduler::logging::{self, LOG_RETENTION_DAYS};
use notify_scheduler::notification::{LogChannel, NotificationProcessor, WebhookChannel, WebhookConfig};
use notify_scheduler::scheduler::{ActorManager, ListenerRegistry, ProcessorRegistry};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("NOTIFY_LOG_DIR").ok();
    let _log_guard = logging::init_logging(log_dir.as_deref())?;
    if let Some(dir) = log_dir {
        tokio::spawn(async move {
            if let Err(e) = logging::cleanup_old_logs(&PathBuf::from(dir), LOG_RETENTION_DAYS).await {
                warn!(error = %e, "Failed to clean up old logs");
            }
        });
    }

    let source = EnvConfigurationSource::default();
    let source: &dyn ConfigurationSource = &source;
    let config = SchedulerConfig::from_source(source)?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:notify.db?mode=rwc".to_string());
    let pool = database::init_pool(&database_url).await?;
    database::run_migrations(&pool).await?;

    let listeners = ListenerRegistry::new();
    let store = Arc::new(SqlxJobInstanceStore::new(pool).with_listeners(listeners.clone()));

    let route_attribute = source
        .get_non_blank("channel.route_attribute")
        .unwrap_or_else(|| DEFAULT_PARTITION_ATTRIBUTE.to_string());
    let mut notifications = NotificationProcessor::new().with_route_attribute(route_attribute);
    for channel_type in source.get_list("channel.log.types") {
        notifications = notifications.with_channel(Arc::new(LogChannel::new(channel_type)));
    }
    if notifications.channel_types().is_empty() {
        notifications = notifications.with_channel(Arc::new(LogChannel::default()));
    }
    if let Some(webhook) = WebhookConfig::from_source(source)? {
        info!(url = %webhook.url, channel = %webhook.channel_type, "Webhook channel enabled");
        notifications = notifications.with_channel(Arc::new(WebhookChannel::new(webhook)?));
    }
    let notifications = Arc::new(notifications);

    let instance_types: BTreeSet<String> = config
        .partitions
        .iter()
        .map(|p| p.key.instance_type().to_string())
        .collect();
    let processors = instance_types
        .into_iter()
        .fold(ProcessorRegistry::new(), |registry, instance_type| {
            registry.with(instance_type, notifications.clone())
        });

    let partitions = config.partitions.clone();
    let manager = ActorManager::start(config, store, processors).await?;
    for partition in &partitions {
        match &partition.fan_out {
            Some(values) => {
                for value in values {
                    manager.register_listener(value, &listeners);
                }
            }
            None => {
                manager.register_listener(partition.key.name(), &listeners);
            }
        }
    }

    info!(
        "notify-scheduler running with partitions {:?}",
        manager.partitions()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let report = manager.stop().await;
    info!(
        total_partitions = report.total_partitions,
        completed_cycles = report.completed_cycles,
        forced_terminations = report.forced_terminations,
        "notify-scheduler stopped"
    );

    Ok(())
}
