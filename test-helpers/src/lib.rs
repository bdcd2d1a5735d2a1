//! Shared harness for database-backed end-to-end tests.
//!
//! `spawn_app` starts a full service instance (scheduler, producers and
//! HTTP server) against a freshly created database, with the mocked clock
//! and the test-only mint endpoint enabled. It needs a reachable Postgres
//! via `DATABASE_URL`; when the variable is unset it returns `None` so
//! suites skip rather than fail on machines without a database.

use std::time::Duration;

use api::notify::NotifyConfig;
use api::rounds::RoundConfig;
use api::time::TimeSource;
use api::{Config, Services, build, telemetry};
use payloads::{APIClient, UserId, requests};
use sqlx::PgPool;
use sqlx::postgres::PgConnectOptions;
use tracing_log::LogTracer;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../api/migrations");

pub struct TestApp {
    pub port: u16,
    pub db_pool: PgPool,
    pub time_source: TimeSource,
}

impl TestApp {
    pub fn address(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// A client acting as the given user.
    pub fn client(&self, user_id: &str) -> APIClient {
        APIClient::new(self.address(), Some(UserId(user_id.to_string())))
    }

    pub fn anonymous_client(&self) -> APIClient {
        APIClient::new(self.address(), None)
    }

    /// Move the mocked clock; the scheduler picks up newly due jobs on its
    /// next (real-time) tick.
    pub fn advance(&self, span: jiff::Span) {
        self.time_source.advance(span);
    }

    /// Seed a user with stars and optionally gifts.
    pub async fn mint(
        &self,
        user_id: &str,
        stars: i64,
        gift: Option<(&str, i64)>,
    ) -> anyhow::Result<()> {
        self.client(user_id)
            .mint(&requests::Mint {
                stars,
                gift_name: gift.map(|(name, _)| name.to_string()),
                gift_count: gift.map(|(_, count)| count).unwrap_or(0),
            })
            .await?;
        Ok(())
    }
}

/// Spawn a complete app instance, or `None` without a database.
pub async fn spawn_app() -> Option<TestApp> {
    let Ok(base_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set; skipping database-backed test");
        return None;
    };

    let subscriber = telemetry::get_subscriber("error".into());
    let _ = LogTracer::init();
    let _ = subscriber.try_init();

    let time_source = TimeSource::new("2025-01-01T00:00:00Z".parse().unwrap());

    let (db_pool, db_name) = setup_database(&base_url)
        .await
        .expect("failed to set up test database");

    let mut config = Config {
        database_url: format!("{base_url}/{db_name}"),
        ip: "127.0.0.1".into(),
        port: 0,
        allowed_origins: vec!["*".to_string()],
        worker_concurrency: 8,
        // fast ticks keep mocked-clock tests snappy
        scheduler_tick: Duration::from_millis(50),
        round: RoundConfig::default(),
        notify: NotifyConfig::default(),
    };

    let services = Services::new(
        db_pool.clone(),
        time_source.clone(),
        config.round.clone(),
        config.notify.clone(),
    );
    services.spawn_background(&config);

    let server = build(&mut config, &services).await.unwrap();
    tokio::spawn(server);

    Some(TestApp {
        port: config.port,
        db_pool,
        time_source,
    })
}

/// Create a uniquely named database for this app and migrate it.
async fn setup_database(
    base_url: &str,
) -> anyhow::Result<(PgPool, String)> {
    let admin_pool = PgPool::connect(base_url).await?;
    let db_name = format!("starbid_test_{}", Uuid::new_v4().simple());
    sqlx::query(&format!(r#"CREATE DATABASE "{db_name}";"#))
        .execute(&admin_pool)
        .await?;

    let options: PgConnectOptions = base_url.parse()?;
    let pool = PgPool::connect_with(options.database(&db_name)).await?;
    MIGRATOR.run(&pool).await?;
    Ok((pool, db_name))
}

/// Poll `predicate` (every 50 ms of real time) until it holds or the
/// timeout elapses.
pub async fn wait_for<F, Fut>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
