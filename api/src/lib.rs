pub mod engine;
pub mod fast;
pub mod notify;
pub mod rounds;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod time;

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::{App, HttpServer, web};
use sqlx::PgPool;

use crate::engine::BidEngine;
use crate::fast::{FastStore, lock::UserLocks, rate::RateLimiter};
use crate::notify::{NotificationBus, NotifyConfig};
use crate::rounds::{RoundConfig, RoundProcessor};
use crate::scheduler::{DEFAULT_WORKER_CONCURRENCY, Scheduler};
use crate::time::TimeSource;

/// Configuration loaded from environment variables at startup.
pub struct Config {
    pub database_url: String,
    /// set to "0.0.0.0" for public access, "127.0.0.1" for local dev
    pub ip: String,
    /// set to 0 to get an os-assigned port
    pub port: u16,
    /// List of allowed CORS origins. Use "*" to allow any origin
    /// (development only)
    pub allowed_origins: Vec<String>,
    /// Concurrent scheduler job executions.
    pub worker_concurrency: usize,
    /// How often the scheduler polls for due jobs.
    pub scheduler_tick: Duration,
    pub round: RoundConfig,
    pub notify: NotifyConfig,
}

impl Config {
    pub fn from_env() -> Self {
        use std::env::var;

        let allowed_origins = var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Config {
            database_url: var("DATABASE_URL").unwrap(),
            ip: var("IP_ADDRESS").unwrap(),
            port: var("PORT").unwrap().parse().unwrap(),
            allowed_origins,
            worker_concurrency: var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
            scheduler_tick: Duration::from_millis(
                var("SCHEDULER_TICK_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(250),
            ),
            round: RoundConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

/// The wired service graph shared by the HTTP server and the background
/// tasks. Building it is side-effect free; `spawn_background` starts the
/// moving parts.
pub struct Services {
    pub pool: PgPool,
    pub time_source: TimeSource,
    pub fast: Arc<FastStore>,
    pub engine: BidEngine,
    pub locks: UserLocks,
    pub limiter: RateLimiter,
    pub notifier: Arc<NotificationBus>,
    pub processor: Arc<RoundProcessor>,
}

impl Services {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        round_config: RoundConfig,
        notify_config: NotifyConfig,
    ) -> Self {
        let fast = Arc::new(FastStore::new());
        let locks = UserLocks::new(Arc::clone(&fast), time_source.clone());
        let notifier = Arc::new(NotificationBus::new(
            pool.clone(),
            Arc::clone(&fast),
            time_source.clone(),
            notify_config,
        ));
        let processor = Arc::new(RoundProcessor::new(
            pool.clone(),
            Arc::clone(&fast),
            locks.clone(),
            Arc::clone(&notifier),
            time_source.clone(),
            round_config,
        ));
        Self {
            engine: BidEngine::new(Arc::clone(&fast)),
            limiter: RateLimiter::new(Arc::clone(&fast)),
            pool,
            time_source,
            fast,
            locks,
            notifier,
            processor,
        }
    }

    /// Start the scheduler worker pool, the all-auctions producer and the
    /// fast-store sweeper.
    pub fn spawn_background(&self, config: &Config) {
        let scheduler = Scheduler::new(
            self.pool.clone(),
            Arc::clone(&self.processor),
            self.time_source.clone(),
            config.scheduler_tick,
            config.worker_concurrency,
        );
        tokio::spawn(async move {
            scheduler.run().await;
        });
        self.notifier.spawn_all_auctions_producer();
        self.fast
            .spawn_sweeper(self.time_source.clone(), Duration::from_secs(5));
    }
}

/// Build the server, but not await it.
///
/// Returns the port that the server has bound to by modifying the config.
pub async fn build(
    config: &mut Config,
    services: &Services,
) -> std::io::Result<Server> {
    let db_pool = web::Data::new(services.pool.clone());
    let time_source = web::Data::new(services.time_source.clone());
    let fast = web::Data::from(Arc::clone(&services.fast));
    let engine = web::Data::new(services.engine.clone());
    let locks = web::Data::new(services.locks.clone());
    let limiter = web::Data::new(services.limiter.clone());
    let notifier = web::Data::from(Arc::clone(&services.notifier));
    let processor = web::Data::from(Arc::clone(&services.processor));

    let allowed_origins = config.allowed_origins.clone();

    // OS assigns the port if binding to 0
    let listener = TcpListener::bind(format!("{}:{}", config.ip, config.port))?;
    config.port = listener.local_addr()?.port();
    let server = HttpServer::new(move || {
        // Configure CORS based on allowed origins
        let cors = if allowed_origins.contains(&"*".to_string()) {
            Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
        } else {
            let mut cors = Cors::default()
                .allow_any_method()
                .allow_any_header();
            for origin in &allowed_origins {
                cors = cors.allowed_origin(origin);
            }
            cors
        };

        App::new()
            .wrap(cors)
            .service(routes::api_services())
            .app_data(db_pool.clone())
            .app_data(time_source.clone())
            .app_data(fast.clone())
            .app_data(engine.clone())
            .app_data(locks.clone())
            .app_data(limiter.clone())
            .app_data(notifier.clone())
            .app_data(processor.clone())
    })
    .listen(listener)?
    .run();
    Ok(server)
}
