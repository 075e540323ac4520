//! Store contract checks against real PostgreSQL / Redis servers.
//! Each test returns early when its server URL is not set.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use jobqueue::{
    clock::mock::MockClock,
    config::{DatabaseConnectionConfig, RedisConnectionConfig},
    Clock, DatabaseDriver, JobId, JobPayload, QueueDriver, QueueError, RedisDriver,
};
use serde_json::json;

mod helpers;

async fn check_driver_contract(driver: Arc<dyn QueueDriver>, clock: Arc<MockClock>) {
    let now = clock.now();
    for n in 0..10 {
        driver
            .enqueue("default", &JobPayload::new("Job", json!({ "n": n })), now)
            .await
            .expect("Failed to enqueue");
    }
    driver
        .enqueue(
            "later",
            &JobPayload::new("Delayed", json!({})),
            now + ChronoDuration::seconds(60),
        )
        .await
        .expect("Failed to enqueue");
    assert_eq!(driver.size("default").await.unwrap(), 10);

    // Concurrent claims never share a job
    let (a, b) = tokio::join!(driver.claim_batch(None, 6), driver.claim_batch(None, 6));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.len() + b.len(), 10);
    let ids: HashSet<JobId> = a.iter().chain(b.iter()).map(|job| job.id().clone()).collect();
    assert_eq!(ids.len(), 10);
    assert!(a.iter().chain(b.iter()).all(|job| *job.attempts() == 1));

    let counts = driver.counts().await.unwrap();
    assert_eq!(counts.active, 10);
    assert_eq!(counts.waiting, 1);

    let mut jobs = a.into_iter().chain(b);
    let done = jobs.next().unwrap();
    driver.ack(&done).await.unwrap();

    let retried = jobs.next().unwrap();
    driver
        .release(&retried, now + ChronoDuration::seconds(5))
        .await
        .unwrap();
    assert!(driver.claim_batch(Some("default"), 10).await.unwrap().is_empty());

    let dead = jobs.next().unwrap();
    let record = driver.dead_letter(&dead, "boom").await.unwrap();
    assert_eq!(record.exception(), "boom");
    assert_eq!(record.attempts(), &1);

    clock.advance(ChronoDuration::seconds(5));
    let again = driver.claim_batch(Some("default"), 10).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id(), retried.id());
    assert_eq!(again[0].attempts(), &2);
    let stale = jobs.next().unwrap();

    clock.advance(ChronoDuration::minutes(31));
    let stalled = driver
        .release_stalled(Duration::from_secs(30 * 60))
        .await
        .unwrap();
    assert_eq!(stalled.len(), 8);
    assert!(driver
        .release_stalled(Duration::from_secs(30 * 60))
        .await
        .unwrap()
        .is_empty());

    let counts = driver.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.active, 0);

    let replayed = driver.retry_dead_letter(record.id()).await.unwrap();
    assert!(driver.dead_letters().await.unwrap().is_empty());
    let claimed = driver.claim_batch(Some("default"), 20).await.unwrap();
    let replayed_job = claimed.iter().find(|job| job.id() == &replayed).unwrap();
    assert_eq!(replayed_job.attempts(), &1);

    // The worker that stalled comes back after its job was handed out again
    let reclaimed = claimed.iter().find(|job| job.id() == stale.id()).unwrap();
    assert_eq!(reclaimed.attempts(), &2);
    assert!(matches!(
        driver.release(&stale, clock.now()).await,
        Err(QueueError::ReservationLost(_))
    ));
    assert!(matches!(
        driver.ack(&stale).await,
        Err(QueueError::ReservationLost(_))
    ));
    assert!(matches!(
        driver.dead_letter(&stale, "late").await,
        Err(QueueError::ReservationLost(_))
    ));
    assert!(driver.claim_batch(Some("default"), 20).await.unwrap().is_empty());
    driver.ack(reclaimed).await.unwrap();

    assert_eq!(driver.clear("later").await.unwrap(), 1);
    assert_eq!(driver.size("later").await.unwrap(), 0);
}

#[tokio::test]
async fn database_driver_honors_the_contract() {
    let Some(url) = helpers::database_url() else {
        return;
    };
    helpers::enable_logs().await;

    let clock = Arc::new(MockClock::new(Utc::now()));
    let config = DatabaseConnectionConfig {
        schema: helpers::unique_namespace(),
        ..DatabaseConnectionConfig::new(url)
    };
    let driver = DatabaseDriver::connect(&config, clock.clone())
        .await
        .expect("Failed to connect to the database");
    // Migrating twice is a no-op
    jobqueue_migrations::migrate(driver.pool(), driver.escaped_schema())
        .await
        .expect("Failed to re-run migrations");

    let pool = driver.pool().clone();
    let schema = driver.escaped_schema().to_string();
    check_driver_contract(Arc::new(driver), clock).await;

    sqlx::query(&format!("drop schema {schema} cascade"))
        .execute(&pool)
        .await
        .expect("Failed to drop test schema");
}

#[tokio::test]
async fn redis_driver_honors_the_contract() {
    let Some(url) = helpers::redis_url() else {
        return;
    };
    helpers::enable_logs().await;

    let clock = Arc::new(MockClock::new(Utc::now()));
    let config = RedisConnectionConfig {
        prefix: helpers::unique_namespace(),
        ..RedisConnectionConfig::from_url(url)
    };
    let driver = RedisDriver::connect(&config, clock.clone())
        .await
        .expect("Failed to connect to redis");
    check_driver_contract(Arc::new(driver), clock).await;
}
