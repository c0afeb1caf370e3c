use std::sync::Arc;
use axum::{debug_handler, extract::{Query, State}, http::{HeaderMap, StatusCode}, response::IntoResponse, routing::{get, patch, post}, Json, Router};
use tower_http::trace::TraceLayer;

use crate::{
    daily::{generate_feed_for, DailyTask},
    email::Mailer,
    generator::FeedGenerator,
    identity::{session_token, IdentityProvider},
    models::{day_bounds, now, parse_day, AppError, FeedResponse, FeedbackRequest, HomeQuery, IdeaLikeRequest, TopicsResponse, User, UserResponse},
    repository::{FeedRepository, UserRepository},
    topics::{normalize_topics, suggested_topics},
};

pub const CRON_KEY_HEADER: &str = "x-cron-key";

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserRepository>,
    pub feeds: Arc<dyn FeedRepository>,
    pub identity: Arc<dyn IdentityProvider>,
    pub generator: Arc<dyn FeedGenerator>,
    pub mailer: Arc<dyn Mailer>,
    pub cron_key: Option<String>,
    pub batch_limit: usize,
    pub page_size: u32,
    pub db: Option<sqlx::PgPool>,
    pub redis: Option<redis::Client>,
}

impl AppState {
    pub fn daily_task(&self) -> DailyTask {
        DailyTask {
            users: self.users.clone(),
            feeds: self.feeds.clone(),
            generator: self.generator.clone(),
            mailer: self.mailer.clone(),
            batch_limit: self.batch_limit,
            page_size: self.page_size,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/topics", get(get_topics).patch(update_topics))
        .route("/home", get(home))
        .route("/regen", get(regen))
        .route("/feedback", post(feedback))
        .route("/idealike", patch(idea_like))
        .route("/daily", post(daily))
        .route("/healthz", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn current_clerk_id(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let token = session_token(headers).ok_or_else(|| AppError::Unauthorized("missing session token".into()))?;
    state.identity.user_id_from_token(&token).await
}

/// Loads the signed-in user, registering them on first sight.
async fn ensure_user(state: &AppState, clerk_id: &str) -> Result<User, AppError> {
    match state.users.find_by_clerk_id(clerk_id).await {
        Ok(user) => Ok(user),
        Err(AppError::NotFound(_)) => {
            let email = state.identity.primary_email(clerk_id).await?;
            match state.users.create(User::new(clerk_id, email.clone())).await {
                Ok(user) => {
                    tracing::info!(clerk_id, "registered new user");
                    Ok(user)
                }
                // Either a concurrent first request won, or the email belongs
                // to an older provider account for the same person.
                Err(AppError::Conflict(_)) => match state.users.find_by_clerk_id(clerk_id).await {
                    Err(AppError::NotFound(_)) => {
                        let user = state.users.relink_email(&email, clerk_id).await?;
                        tracing::info!(clerk_id, "relinked existing user to new provider id");
                        Ok(user)
                    }
                    found => found,
                },
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

#[debug_handler]
pub async fn get_topics(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let clerk_id = current_clerk_id(&state, &headers).await?;
    let user = ensure_user(&state, &clerk_id).await?;
    Ok(Json(TopicsResponse { suggested_topics: suggested_topics(&user.preferred_topics), preferred_topics: user.preferred_topics }))
}

#[debug_handler]
pub async fn update_topics(State(state): State<AppState>, headers: HeaderMap, Json(topics): Json<Vec<String>>) -> Result<impl IntoResponse, AppError> {
    let clerk_id = current_clerk_id(&state, &headers).await?;
    let user = state.users.set_preferred_topics(&clerk_id, normalize_topics(topics)).await?;
    Ok(Json(UserResponse::from(user)))
}

pub async fn home(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<HomeQuery>) -> Result<impl IntoResponse, AppError> {
    let clerk_id = current_clerk_id(&state, &headers).await?;
    let target = match q.date.as_deref() {
        Some(d) if !d.trim().is_empty() => parse_day(d)?,
        _ => now(),
    };
    let (start, end) = day_bounds(target);
    let feed = state.feeds.latest_between(&clerk_id, start, end).await?;
    Ok(Json(feed.map(FeedResponse::from).unwrap_or_else(FeedResponse::empty)))
}

pub async fn regen(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let clerk_id = current_clerk_id(&state, &headers).await?;
    let user = state.users.find_by_clerk_id(&clerk_id).await?;
    let feed = generate_feed_for(state.generator.as_ref(), state.feeds.as_ref(), &user).await?;
    Ok(Json(FeedResponse::from(feed)))
}

pub async fn feedback(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<FeedbackRequest>) -> Result<impl IntoResponse, AppError> {
    let clerk_id = current_clerk_id(&state, &headers).await?;
    let text = req.feedback.trim();
    if text.is_empty() {
        return Err(AppError::Validation("feedback must not be empty".into()));
    }
    state.users.push_feedback(&clerk_id, text.to_string()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn idea_like(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<IdeaLikeRequest>) -> Result<impl IntoResponse, AppError> {
    let clerk_id = current_clerk_id(&state, &headers).await?;
    // Feed and user writes are separate; check the user first so an unknown
    // caller never leaves a liked feed without a matching preference.
    state.users.find_by_clerk_id(&clerk_id).await?;
    let feed = state.feeds.set_idea_liked(req.feed_id, &clerk_id, req.index, req.liked).await?;
    let text = feed.ideas[req.index].preference_text();
    state.users.record_preference(&clerk_id, text, req.liked).await?;
    Ok(Json(FeedResponse::from(feed)))
}

/// Cron trigger: starts the batch in the background and returns immediately.
pub async fn daily(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let given = headers.get(CRON_KEY_HEADER).and_then(|h| h.to_str().ok());
    match (&state.cron_key, given) {
        (Some(expected), Some(given)) if expected == given => {}
        _ => return Err(AppError::Unauthorized("invalid cron key".into())),
    }
    let task = state.daily_task();
    tokio::spawn(async move {
        if let Err(e) = task.run().await {
            tracing::error!(error = %e, "daily task aborted");
        }
    });
    Ok("OK")
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    // Check Postgres if available
    let pg_ok = if let Some(ref pool) = state.db {
        sqlx::query("SELECT 1").fetch_one(pool).await.is_ok()
    } else { false };

    // Check Redis if available
    let redis_ok = if let Some(ref client) = state.redis {
        match client.get_async_connection().await {
            Ok(mut conn) => redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok(),
            Err(_) => false,
        }
    } else { false };

    if pg_ok && redis_ok {
        (StatusCode::OK, Json(serde_json::json!({"status":"ok"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"status":"degraded","postgres": pg_ok, "redis": redis_ok })))
    }
}
