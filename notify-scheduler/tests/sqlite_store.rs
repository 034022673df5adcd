use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use dashmap::DashSet;
use tempfile::TempDir;
use tokio::task::JoinSet;

use notify_scheduler::Error;
use notify_scheduler::config::{PartitionConfig, SchedulerConfig};
use notify_scheduler::database::time::due_to_ms;
use notify_scheduler::database::{DbPool, SqlxJobInstanceStore, init_pool_with_size, run_migrations};
use notify_scheduler::domain::{JobInstanceState, NewJobInstance, PartitionKey, Transition};
use notify_scheduler::notification::{LogChannel, NotificationProcessor};
use notify_scheduler::scheduler::{ActorManager, JobInstanceStore, ListenerRegistry, ProcessorRegistry};

async fn open_db(temp_dir: &TempDir) -> DbPool {
    let db_path = temp_dir.path().join("notify.db");
    let database_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool_with_size(&database_url, 8).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

fn key() -> PartitionKey {
    PartitionKey::builder("notifications").build().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_have_a_single_winner() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SqlxJobInstanceStore::new(open_db(&temp_dir).await));
    let now = Utc::now() - TimeDelta::seconds(1);
    for i in 0..40 {
        store
            .insert(NewJobInstance::new(format!("job-{}", i), now))
            .await
            .unwrap();
    }

    let winners = Arc::new(DashSet::new());
    let claims = Arc::new(AtomicUsize::new(0));
    let mut join_set = JoinSet::new();
    for _ in 0..8 {
        let store = store.clone();
        let winners = winners.clone();
        let claims = claims.clone();
        join_set.spawn(async move {
            let key = key();
            let batch = store.fetch_ready_batch(&key, Utc::now(), 40).await.unwrap();
            for instance in batch {
                if store.try_claim(&key, instance.id, instance.state).await.unwrap() {
                    claims.fetch_add(1, Ordering::SeqCst);
                    assert!(winners.insert(instance.id), "instance {} claimed twice", instance.id);
                }
            }
        });
    }
    while let Some(res) = join_set.join_next().await {
        res.unwrap();
    }

    assert_eq!(winners.len(), 40);
    assert_eq!(claims.load(Ordering::SeqCst), 40);
    assert_eq!(store.count_ready(&key(), Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn ready_batch_respects_due_time_and_order() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqlxJobInstanceStore::new(open_db(&temp_dir).await);
    let now = Utc::now();
    let late = store
        .insert(NewJobInstance::new("late", now - TimeDelta::seconds(10)))
        .await
        .unwrap();
    let early = store
        .insert(NewJobInstance::new("early", now - TimeDelta::seconds(60)))
        .await
        .unwrap();
    let future = now + TimeDelta::minutes(5);
    store
        .insert(NewJobInstance::new("future", future))
        .await
        .unwrap();

    let key = key();
    assert_eq!(store.count_ready(&key, now).await.unwrap(), 2);
    let batch = store.fetch_ready_batch(&key, now, 10).await.unwrap();
    let ids: Vec<i64> = batch.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![early, late]);
    assert_eq!(store.fetch_ready_batch(&key, now, 1).await.unwrap().len(), 1);

    let next = store.next_due_time(&key).await.unwrap().unwrap();
    assert_eq!(next.timestamp_millis(), due_to_ms(now - TimeDelta::seconds(60)));

    for id in [early, late] {
        assert!(store.try_claim(&key, id, JobInstanceState::New).await.unwrap());
        store.commit(&key, id, Transition::done(None)).await.unwrap();
    }
    let next = store.next_due_time(&key).await.unwrap().unwrap();
    assert_eq!(next.timestamp_millis(), due_to_ms(future));
    assert!(next >= future);

    // A due time inside a millisecond is not ready until it has fully passed.
    let sub_ms_key = key.derive("sms").unwrap();
    let base = Utc.timestamp_millis_opt(4_000_000_000_000).single().unwrap();
    let due = base + TimeDelta::microseconds(900);
    let id = store
        .insert(NewJobInstance::new("precise", due).with_attribute("channel_type", "sms"))
        .await
        .unwrap();
    let just_before = due - TimeDelta::microseconds(500);
    assert!(store.fetch_ready_batch(&sub_ms_key, just_before, 10).await.unwrap().is_empty());
    assert_eq!(store.count_ready(&sub_ms_key, just_before).await.unwrap(), 0);
    assert!(store.fetch_ready_batch(&sub_ms_key, due, 10).await.unwrap().is_empty());
    let batch = store
        .fetch_ready_batch(&sub_ms_key, base + TimeDelta::milliseconds(1), 10)
        .await
        .unwrap();
    assert_eq!(batch.iter().map(|i| i.id).collect::<Vec<_>>(), vec![id]);
    assert!(batch[0].due_at >= due);
}

#[tokio::test]
async fn predicates_partition_by_attribute() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqlxJobInstanceStore::new(open_db(&temp_dir).await);
    let now = Utc::now() - TimeDelta::seconds(1);
    let email = store
        .insert(NewJobInstance::new("welcome", now).with_attribute("channel_type", "email"))
        .await
        .unwrap();
    let sms = store
        .insert(NewJobInstance::new("otp", now).with_attribute("channel_type", "sms"))
        .await
        .unwrap();

    let email_key = key().derive("email").unwrap();
    let sms_key = key().derive("sms").unwrap();

    let batch = store.fetch_ready_batch(&email_key, Utc::now(), 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, email);
    assert_eq!(batch[0].attribute("channel_type"), Some("email"));

    // A key cannot claim outside its predicate.
    assert!(!store.try_claim(&email_key, sms, JobInstanceState::New).await.unwrap());
    assert!(store.try_claim(&sms_key, sms, JobInstanceState::New).await.unwrap());
    assert_eq!(store.count_ready(&key(), Utc::now()).await.unwrap(), 1);
}

#[tokio::test]
async fn commit_requires_a_running_instance() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqlxJobInstanceStore::new(open_db(&temp_dir).await);
    let key = key();
    let id = store
        .insert(NewJobInstance::new("job", Utc::now()))
        .await
        .unwrap();

    let err = store.commit(&key, id, Transition::done(None)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { ref from, .. } if from == "NEW"));

    let err = store.commit(&key, 999, Transition::done(None)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    assert!(store.try_claim(&key, id, JobInstanceState::New).await.unwrap());
    let retry_at = Utc::now() + TimeDelta::minutes(1);
    store
        .commit(&key, id, Transition::deferred(retry_at, 1, "gateway busy"))
        .await
        .unwrap();

    let stored = store.get("job_instance", id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobInstanceState::Deferred);
    assert_eq!(stored.failure_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("gateway busy"));
    assert_eq!(stored.due_at.timestamp_millis(), due_to_ms(retry_at));
    assert!(stored.due_at >= retry_at);
    assert_eq!(stored.claimed_at, None);

    // Deferred instances can be claimed again.
    assert!(store.try_claim(&key, id, JobInstanceState::Deferred).await.unwrap());
    store
        .commit(&key, id, Transition::done(Some(serde_json::json!({"sent": true}))))
        .await
        .unwrap();
    let stored = store.get("job_instance", id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobInstanceState::Done);
    assert_eq!(stored.result, Some(serde_json::json!({"sent": true})));
    assert_eq!(stored.last_error.as_deref(), Some("gateway busy"));
}

#[tokio::test]
async fn stale_running_instances_are_reset() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqlxJobInstanceStore::new(open_db(&temp_dir).await);
    let key = key();
    let id = store
        .insert(NewJobInstance::new("job", Utc::now()))
        .await
        .unwrap();
    assert!(store.try_claim(&key, id, JobInstanceState::New).await.unwrap());

    let an_hour_ago = Utc::now() - TimeDelta::hours(1);
    assert_eq!(store.reset_stale_running(&key, an_hour_ago).await.unwrap(), 0);

    let soon = Utc::now() + TimeDelta::seconds(1);
    assert_eq!(store.reset_stale_running(&key, soon).await.unwrap(), 1);
    let stored = store.get("job_instance", id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobInstanceState::Deferred);
    assert_eq!(stored.claimed_at, None);
}

#[tokio::test]
async fn invalid_instance_types_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqlxJobInstanceStore::new(open_db(&temp_dir).await);
    let err = store
        .insert(NewJobInstance::new("job", Utc::now()).with_instance_type("job; DROP TABLE x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(store.get("missing table", 1).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manager_drains_a_sqlite_backed_partition() {
    let temp_dir = TempDir::new().unwrap();
    let listeners = ListenerRegistry::new();
    let store = Arc::new(
        SqlxJobInstanceStore::new(open_db(&temp_dir).await).with_listeners(listeners.clone()),
    );
    let email = Arc::new(LogChannel::new("email"));
    let processors = ProcessorRegistry::new().with(
        "job_instance",
        Arc::new(NotificationProcessor::new().with_channel(email.clone())),
    );
    let config = SchedulerConfig {
        poll_interval: None,
        ..SchedulerConfig::default()
    }
    .with_partition(PartitionConfig::fan_out(key(), ["email"]));

    let manager = ActorManager::start(config, store.clone(), processors)
        .await
        .unwrap();
    assert_eq!(manager.register_listener("email", &listeners), 1);

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = store
            .insert(
                NewJobInstance::new(format!("welcome-{}", i), Utc::now())
                    .with_attribute("channel_type", "email"),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while email.sent() < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(email.sent(), 5);

    let report = manager.stop().await;
    assert!(report.all_graceful());
    for id in ids {
        let stored = store.get("job_instance", id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobInstanceState::Done);
        assert_eq!(stored.result, Some(serde_json::json!({"channel": "email"})));
    }
}

#[tokio::test]
async fn join_fetch_hints_do_not_change_the_ready_set() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqlxJobInstanceStore::new(open_db(&temp_dir).await);
    let now = Utc::now() - TimeDelta::seconds(1);
    let id = store
        .insert(NewJobInstance::new("digest", now).with_attribute("channel_type", "email"))
        .await
        .unwrap();

    let hinted = PartitionKey::builder("notifications")
        .join_fetch("recipient")
        .join_fetch("template.locale")
        .build()
        .unwrap()
        .derive("email")
        .unwrap();
    assert_eq!(hinted.join_fetches(), ["recipient", "template.locale"]);

    assert_eq!(store.count_ready(&hinted, Utc::now()).await.unwrap(), 1);
    let batch = store.fetch_ready_batch(&hinted, Utc::now(), 10).await.unwrap();
    assert_eq!(batch.iter().map(|i| i.id).collect::<Vec<_>>(), vec![id]);
    assert!(store.try_claim(&hinted, id, JobInstanceState::New).await.unwrap());
}
