//! Start-up wiring shared by the server and the batch binary: logging,
//! optional Postgres/Redis connections and adapter construction.

use std::{sync::Arc, time::Duration};

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::daily::DailyTask;
use crate::email::{Mailer, NoopMailer, ResendMailer};
use crate::generator::{FeedGenerator, OpenAiFeedGenerator};
use crate::handlers::AppState;
use crate::identity::{ClerkIdentityProvider, IdentityProvider};
use crate::models::AppError;
use crate::repository::{FeedRepository, RepositoryFactory, UserRepository};

pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,axum=info,tower_http=info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();
    }
}

/// Connects to Postgres and runs migrations; `None` when the database is unusable.
pub async fn connect_postgres(cfg: &AppConfig) -> Option<sqlx::PgPool> {
    match PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&cfg.database.url)
        .await
    {
        Ok(p) => {
            if let Err(e) = sqlx::migrate!("./migrations").run(&p).await {
                tracing::error!(error = %e, "migrations failed; continuing without database");
                None
            } else {
                Some(p)
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Postgres not available; starting with in-memory repositories");
            None
        }
    }
}

/// Opens a Redis client if the server answers PING.
pub async fn connect_redis(cfg: &AppConfig) -> Option<redis::Client> {
    let client = match redis::Client::open(cfg.redis.url.clone()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "Redis client init failed; continuing without Redis");
            return None;
        }
    };
    match client.get_async_connection().await {
        Ok(mut conn) => {
            if redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok() {
                Some(client)
            } else {
                tracing::warn!("Redis PING failed; continuing without Redis");
                None
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis connection failed; continuing without Redis");
            None
        }
    }
}

pub fn repositories(pool: Option<&sqlx::PgPool>) -> (Arc<dyn UserRepository>, Arc<dyn FeedRepository>) {
    match pool {
        Some(p) => RepositoryFactory::postgres(p.clone()),
        None => RepositoryFactory::in_memory(),
    }
}

pub fn mailer(cfg: &AppConfig) -> Result<Arc<dyn Mailer>, AppError> {
    if cfg.email.api_key.is_none() {
        tracing::warn!("RESEND_API_KEY not set; daily emails are disabled");
        return Ok(Arc::new(NoopMailer));
    }
    Ok(Arc::new(ResendMailer::from_config(&cfg.email, Duration::from_secs(cfg.http_timeout_secs))?))
}

pub fn generator(cfg: &AppConfig) -> Result<Arc<dyn FeedGenerator>, AppError> {
    Ok(Arc::new(OpenAiFeedGenerator::from_config(&cfg.generator, Duration::from_secs(cfg.http_timeout_secs))?))
}

/// Everything the HTTP server needs.
pub async fn build_state(cfg: &AppConfig) -> Result<AppState, AppError> {
    let pool = connect_postgres(cfg).await;
    let redis = connect_redis(cfg).await;
    let (users, feeds) = repositories(pool.as_ref());
    let identity = Arc::new(ClerkIdentityProvider::from_config(&cfg.identity, Duration::from_secs(cfg.http_timeout_secs), redis.clone())?) as Arc<dyn IdentityProvider>;
    Ok(AppState {
        users,
        feeds,
        identity,
        generator: generator(cfg)?,
        mailer: mailer(cfg)?,
        cron_key: cfg.daily.cron_key.clone(),
        batch_limit: cfg.daily.batch_limit,
        page_size: cfg.daily.page_size,
        db: pool,
        redis,
    })
}

/// Batch-only wiring; a database is mandatory since in-memory users would be empty.
pub async fn build_daily_task(cfg: &AppConfig) -> Result<DailyTask, AppError> {
    let pool = connect_postgres(cfg).await.ok_or_else(|| AppError::Config("daily task requires a reachable database".into()))?;
    let (users, feeds) = repositories(Some(&pool));
    Ok(DailyTask {
        users,
        feeds,
        generator: generator(cfg)?,
        mailer: mailer(cfg)?,
        batch_limit: cfg.daily.batch_limit,
        page_size: cfg.daily.page_size,
    })
}
