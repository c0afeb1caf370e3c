//! Domain models, DTOs, and error types for the SmallTalk feed service.
//! Users and feeds are the two persisted collections; everything else is a
//! request/response shape or a helper around them.

use axum::{http::StatusCode, response::{IntoResponse, Response}};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Topics every new user starts with.
pub const DEFAULT_TOPICS: [&str; 3] = ["Tech", "Sports", "Weather"];

/// Feedback state of a single idea.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Liked {
    Yes,
    No,
    #[default]
    Unfilled,
}

/// One generated conversation opener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Idea {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub liked: Liked,
}

impl Idea {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self { title: title.into(), description: description.into(), liked: Liked::Unfilled }
    }

    /// Canonical text stored in a user's likes/dislikes. Pushing and pulling
    /// both use this form, so it must stay stable.
    pub fn preference_text(&self) -> String {
        format!("Title: {} #\nDescription: {}", self.title, self.description)
    }
}

/// Registered user with accumulated preference signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Subject id issued by the identity provider.
    pub clerk_id: String,
    pub email: String,
    pub preferred_topics: Vec<String>,
    pub feedback: Vec<String>,
    pub likes: Vec<String>,
    pub dislikes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(clerk_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            clerk_id: clerk_id.into(),
            email: email.into(),
            preferred_topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            feedback: Vec::new(),
            likes: Vec::new(),
            dislikes: Vec::new(),
            created_at: now(),
        }
    }

    pub fn preference_signal(&self) -> PreferenceSignal {
        PreferenceSignal {
            preferred_topics: self.preferred_topics.clone(),
            feedback: self.feedback.clone(),
            likes: self.likes.clone(),
            dislikes: self.dislikes.clone(),
        }
    }
}

/// Everything the generator needs to bias a new feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferenceSignal {
    pub preferred_topics: Vec<String>,
    pub feedback: Vec<String>,
    pub likes: Vec<String>,
    pub dislikes: Vec<String>,
}

/// Ideas generated for one user at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub clerk_id: String,
    pub ideas: Vec<Idea>,
    pub date: DateTime<Utc>,
}

impl Feed {
    pub fn new(clerk_id: impl Into<String>, ideas: Vec<Idea>) -> Self {
        Self { id: Uuid::new_v4(), clerk_id: clerk_id.into(), ideas, date: now() }
    }
}

/// Application-wide error type with variants mapped to HTTP status codes.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("jwt error: {0}")]
    Jwt(String),
    #[error("repository error: {0}")]
    Repo(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            // Bad or expired session tokens are the caller's problem.
            AppError::Unauthorized(_) | AppError::Jwt(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Repo(_) | AppError::Parse(_) | AppError::Config(_) | AppError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(e: jsonwebtoken::errors::Error) -> Self { AppError::Jwt(e.to_string()) }
}
impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self { AppError::Upstream(e.to_string()) }
}
impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self { AppError::Repo(e.to_string()) }
}
impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self { AppError::Repo(e.to_string()) }
}
impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self { AppError::Parse(e.to_string()) }
}
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self { AppError::Config(e.to_string()) }
}
impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self { AppError::Unknown(e.to_string()) }
}

// Requests and Responses

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicsResponse {
    pub suggested_topics: Vec<String>,
    pub preferred_topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub ideas: Vec<Idea>,
    pub feed_id: Option<Uuid>,
}

impl FeedResponse {
    pub fn empty() -> Self { Self { ideas: Vec::new(), feed_id: None } }
}

impl From<Feed> for FeedResponse {
    fn from(f: Feed) -> Self { Self { ideas: f.ideas, feed_id: Some(f.id) } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaLikeRequest {
    pub feed_id: Uuid,
    pub index: usize,
    pub liked: Liked,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeQuery {
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub clerk_id: String,
    pub email: String,
    pub preferred_topics: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self { id: u.id, clerk_id: u.clerk_id, email: u.email, preferred_topics: u.preferred_topics, created_at: u.created_at }
    }
}

pub fn now() -> DateTime<Utc> { Utc::now() }

/// Start and exclusive end of the UTC calendar day containing `at`.
pub fn day_bounds(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&at.date_naive().and_time(chrono::NaiveTime::MIN));
    (start, start + Duration::days(1))
}

/// Parses a `date` query value: a plain `YYYY-MM-DD` day or an RFC 3339 timestamp.
pub fn parse_day(param: &str) -> Result<DateTime<Utc>, AppError> {
    let param = param.trim();
    if let Ok(day) = NaiveDate::parse_from_str(param, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN)));
    }
    DateTime::parse_from_rfc3339(param)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| AppError::Validation("Invalid date parameter".into()))
}
