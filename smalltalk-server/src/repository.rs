//! Repository layer: async traits over the user and feed collections, with a
//! Postgres implementation and an in-memory one used for tests and as a
//! fallback when no database is reachable.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{AppError, Feed, Idea, Liked, User};

/// Paginated listing options.
#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub page: u32,
    pub per_page: u32,
}

impl ListOptions {
    pub fn clamp(self, max_per_page: u32) -> Self {
        let per = self.per_page.min(max_per_page).max(1);
        let page = self.page.max(1);
        Self { page, per_page: per }
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: User) -> Result<User, AppError>;
    async fn find_by_clerk_id(&self, clerk_id: &str) -> Result<User, AppError>;
    /// Re-keys the user owning `email` (case-insensitive) to `clerk_id`. Used
    /// when the identity provider issues a new subject for a known address.
    async fn relink_email(&self, email: &str, clerk_id: &str) -> Result<User, AppError>;
    async fn list(&self, opts: ListOptions) -> Result<(Vec<User>, usize), AppError>;
    async fn set_preferred_topics(&self, clerk_id: &str, topics: Vec<String>) -> Result<User, AppError>;
    async fn push_feedback(&self, clerk_id: &str, feedback: String) -> Result<(), AppError>;
    /// Moves `text` into likes or dislikes according to `liked`, or out of both for `Unfilled`.
    async fn record_preference(&self, clerk_id: &str, text: String, liked: Liked) -> Result<(), AppError>;
}

#[async_trait]
pub trait FeedRepository: Send + Sync {
    async fn create(&self, feed: Feed) -> Result<Feed, AppError>;
    /// Newest feed for the user with `start <= date < end`.
    async fn latest_between(&self, clerk_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Option<Feed>, AppError>;
    async fn set_idea_liked(&self, feed_id: Uuid, clerk_id: &str, index: usize, liked: Liked) -> Result<Feed, AppError>;
}

/// Applies a like/dislike/clear to a pair of preference lists.
pub fn apply_preference(likes: &mut Vec<String>, dislikes: &mut Vec<String>, text: &str, liked: Liked) {
    likes.retain(|l| l != text);
    dislikes.retain(|d| d != text);
    match liked {
        Liked::Yes => likes.push(text.to_string()),
        Liked::No => dislikes.push(text.to_string()),
        Liked::Unfilled => {}
    }
}

fn idea_index_error(index: usize, len: usize) -> AppError {
    AppError::Validation(format!("idea index {} out of range (feed has {} ideas)", index, len))
}

/// Simple in-memory users keyed by clerk id.
#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    inner: Arc<RwLock<HashMap<String, User>>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self { Self { inner: Arc::new(RwLock::new(HashMap::new())) } }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: User) -> Result<User, AppError> {
        let mut map = self.inner.write().await;
        if map.contains_key(&user.clerk_id) || map.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(AppError::Conflict("user already exists".into()));
        }
        map.insert(user.clerk_id.clone(), user.clone());
        Ok(user)
    }

    async fn find_by_clerk_id(&self, clerk_id: &str) -> Result<User, AppError> {
        let map = self.inner.read().await;
        map.get(clerk_id).cloned().ok_or_else(|| AppError::NotFound("user not found".into()))
    }

    async fn relink_email(&self, email: &str, clerk_id: &str) -> Result<User, AppError> {
        let mut map = self.inner.write().await;
        if map.contains_key(clerk_id) {
            return Err(AppError::Conflict("user already exists".into()));
        }
        let old_id = map
            .iter()
            .find(|(_, u)| u.email.eq_ignore_ascii_case(email))
            .map(|(id, _)| id.clone())
            .ok_or_else(|| AppError::NotFound("user not found".into()))?;
        let mut user = map.remove(&old_id).ok_or_else(|| AppError::NotFound("user not found".into()))?;
        user.clerk_id = clerk_id.to_string();
        user.email = email.to_string();
        map.insert(user.clerk_id.clone(), user.clone());
        Ok(user)
    }

    async fn list(&self, opts: ListOptions) -> Result<(Vec<User>, usize), AppError> {
        let map = self.inner.read().await;
        let mut users: Vec<User> = map.values().cloned().collect();
        users.sort_by_key(|u| u.created_at);
        let total = users.len();
        let start = ((opts.page.saturating_sub(1)) as usize).saturating_mul(opts.per_page as usize);
        let end = (start + opts.per_page as usize).min(total);
        let slice = if start < end { users[start..end].to_vec() } else { Vec::new() };
        Ok((slice, total))
    }

    async fn set_preferred_topics(&self, clerk_id: &str, topics: Vec<String>) -> Result<User, AppError> {
        let mut map = self.inner.write().await;
        let user = map.get_mut(clerk_id).ok_or_else(|| AppError::NotFound("user not found".into()))?;
        user.preferred_topics = topics;
        Ok(user.clone())
    }

    async fn push_feedback(&self, clerk_id: &str, feedback: String) -> Result<(), AppError> {
        let mut map = self.inner.write().await;
        let user = map.get_mut(clerk_id).ok_or_else(|| AppError::NotFound("user not found".into()))?;
        user.feedback.push(feedback);
        Ok(())
    }

    async fn record_preference(&self, clerk_id: &str, text: String, liked: Liked) -> Result<(), AppError> {
        let mut map = self.inner.write().await;
        let user = map.get_mut(clerk_id).ok_or_else(|| AppError::NotFound("user not found".into()))?;
        apply_preference(&mut user.likes, &mut user.dislikes, &text, liked);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFeedRepository {
    inner: Arc<RwLock<HashMap<Uuid, Feed>>>,
}

impl InMemoryFeedRepository {
    pub fn new() -> Self { Self { inner: Arc::new(RwLock::new(HashMap::new())) } }
}

#[async_trait]
impl FeedRepository for InMemoryFeedRepository {
    async fn create(&self, feed: Feed) -> Result<Feed, AppError> {
        let mut map = self.inner.write().await;
        map.insert(feed.id, feed.clone());
        Ok(feed)
    }

    async fn latest_between(&self, clerk_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Option<Feed>, AppError> {
        let map = self.inner.read().await;
        Ok(map
            .values()
            .filter(|f| f.clerk_id == clerk_id && f.date >= start && f.date < end)
            .max_by_key(|f| f.date)
            .cloned())
    }

    async fn set_idea_liked(&self, feed_id: Uuid, clerk_id: &str, index: usize, liked: Liked) -> Result<Feed, AppError> {
        let mut map = self.inner.write().await;
        let feed = map
            .get_mut(&feed_id)
            .filter(|f| f.clerk_id == clerk_id)
            .ok_or_else(|| AppError::NotFound("feed not found".into()))?;
        let len = feed.ideas.len();
        let idea = feed.ideas.get_mut(index).ok_or_else(|| idea_index_error(index, len))?;
        idea.liked = liked;
        Ok(feed.clone())
    }
}

#[derive(Clone)]
pub struct PostgresUserRepository { pub pool: PgPool }
impl PostgresUserRepository { pub fn new(pool: PgPool) -> Self { Self { pool } } }

const USER_COLUMNS: &str = "id, clerk_id, email, preferred_topics, feedback, likes, dislikes, created_at";

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        clerk_id: row.get("clerk_id"),
        email: row.get("email"),
        preferred_topics: row.get("preferred_topics"),
        feedback: row.get("feedback"),
        likes: row.get("likes"),
        dislikes: row.get("dislikes"),
        created_at: row.get("created_at"),
    }
}

fn not_found_or_repo(e: sqlx::Error, what: &str) -> AppError {
    match e {
        sqlx::Error::RowNotFound => AppError::NotFound(format!("{} not found", what)),
        other => AppError::Repo(other.to_string()),
    }
}

fn conflict_or_repo(e: sqlx::Error, what: &str) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict(format!("{} already exists", what)),
        _ => not_found_or_repo(e, what),
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn create(&self, user: User) -> Result<User, AppError> {
        let sql = format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(user.id)
            .bind(&user.clerk_id)
            .bind(&user.email)
            .bind(&user.preferred_topics)
            .bind(&user.feedback)
            .bind(&user.likes)
            .bind(&user.dislikes)
            .bind(user.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| conflict_or_repo(e, "user"))?;
        Ok(user_from_row(&row))
    }

    async fn find_by_clerk_id(&self, clerk_id: &str) -> Result<User, AppError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE clerk_id = $1");
        let row = sqlx::query(&sql)
            .bind(clerk_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| not_found_or_repo(e, "user"))?;
        Ok(user_from_row(&row))
    }

    async fn relink_email(&self, email: &str, clerk_id: &str) -> Result<User, AppError> {
        let sql = format!(
            "UPDATE users SET clerk_id = $2, email = $1 WHERE lower(email) = lower($1) RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(email)
            .bind(clerk_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| conflict_or_repo(e, "user"))?;
        Ok(user_from_row(&row))
    }

    async fn list(&self, opts: ListOptions) -> Result<(Vec<User>, usize), AppError> {
        let offset = ((opts.page.saturating_sub(1)) as i64) * (opts.per_page as i64);
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC, id ASC LIMIT $1 OFFSET $2");
        let rows = sqlx::query(&sql)
            .bind(opts.per_page as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        let count_row = sqlx::query("SELECT COUNT(*) FROM users").fetch_one(&self.pool).await?;
        let total: i64 = count_row.get(0);
        Ok((rows.iter().map(user_from_row).collect(), total as usize))
    }

    async fn set_preferred_topics(&self, clerk_id: &str, topics: Vec<String>) -> Result<User, AppError> {
        let sql = format!("UPDATE users SET preferred_topics = $2 WHERE clerk_id = $1 RETURNING {USER_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(clerk_id)
            .bind(&topics)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| not_found_or_repo(e, "user"))?;
        Ok(user_from_row(&row))
    }

    async fn push_feedback(&self, clerk_id: &str, feedback: String) -> Result<(), AppError> {
        let res = sqlx::query("UPDATE users SET feedback = array_append(feedback, $2) WHERE clerk_id = $1")
            .bind(clerk_id)
            .bind(feedback)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 { return Err(AppError::NotFound("user not found".into())); }
        Ok(())
    }

    async fn record_preference(&self, clerk_id: &str, text: String, liked: Liked) -> Result<(), AppError> {
        let sql = match liked {
            Liked::Yes => "UPDATE users SET likes = array_append(array_remove(likes, $2), $2), dislikes = array_remove(dislikes, $2) WHERE clerk_id = $1",
            Liked::No => "UPDATE users SET dislikes = array_append(array_remove(dislikes, $2), $2), likes = array_remove(likes, $2) WHERE clerk_id = $1",
            Liked::Unfilled => "UPDATE users SET likes = array_remove(likes, $2), dislikes = array_remove(dislikes, $2) WHERE clerk_id = $1",
        };
        let res = sqlx::query(sql).bind(clerk_id).bind(text).execute(&self.pool).await?;
        if res.rows_affected() == 0 { return Err(AppError::NotFound("user not found".into())); }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresFeedRepository { pub pool: PgPool }
impl PostgresFeedRepository { pub fn new(pool: PgPool) -> Self { Self { pool } } }

fn feed_from_row(row: &PgRow) -> Feed {
    let ideas: Json<Vec<Idea>> = row.get("ideas");
    Feed { id: row.get("id"), clerk_id: row.get("clerk_id"), ideas: ideas.0, date: row.get("date") }
}

#[async_trait]
impl FeedRepository for PostgresFeedRepository {
    async fn create(&self, feed: Feed) -> Result<Feed, AppError> {
        let row = sqlx::query(
            r#"INSERT INTO feeds (id, clerk_id, ideas, date)
               VALUES ($1, $2, $3, $4)
               RETURNING id, clerk_id, ideas, date"#,
        )
        .bind(feed.id)
        .bind(&feed.clerk_id)
        .bind(Json(&feed.ideas))
        .bind(feed.date)
        .fetch_one(&self.pool)
        .await?;
        Ok(feed_from_row(&row))
    }

    async fn latest_between(&self, clerk_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Option<Feed>, AppError> {
        let row = sqlx::query(
            r#"SELECT id, clerk_id, ideas, date FROM feeds
               WHERE clerk_id = $1 AND date >= $2 AND date < $3
               ORDER BY date DESC LIMIT 1"#,
        )
        .bind(clerk_id)
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(feed_from_row))
    }

    async fn set_idea_liked(&self, feed_id: Uuid, clerk_id: &str, index: usize, liked: Liked) -> Result<Feed, AppError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT id, clerk_id, ideas, date FROM feeds WHERE id = $1 AND clerk_id = $2 FOR UPDATE")
            .bind(feed_id)
            .bind(clerk_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound("feed not found".into()))?;
        let mut feed = feed_from_row(&row);
        let len = feed.ideas.len();
        feed.ideas.get_mut(index).ok_or_else(|| idea_index_error(index, len))?.liked = liked;
        sqlx::query("UPDATE feeds SET ideas = $2 WHERE id = $1")
            .bind(feed_id)
            .bind(Json(&feed.ideas))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(feed)
    }
}

/// Factory for repositories; selects between drivers at start-up.
#[derive(Debug, Clone)]
pub struct RepositoryFactory;

impl RepositoryFactory {
    pub fn postgres(pool: PgPool) -> (Arc<dyn UserRepository>, Arc<dyn FeedRepository>) {
        (Arc::new(PostgresUserRepository::new(pool.clone())), Arc::new(PostgresFeedRepository::new(pool)))
    }
    pub fn in_memory() -> (Arc<dyn UserRepository>, Arc<dyn FeedRepository>) {
        (Arc::new(InMemoryUserRepository::new()), Arc::new(InMemoryFeedRepository::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ideas(n: usize) -> Vec<Idea> {
        (0..n).map(|i| Idea::new(format!("t{}", i), format!("d{}", i))).collect()
    }

    #[test]
    fn preference_moves_between_lists() {
        let (mut likes, mut dislikes) = (Vec::new(), Vec::new());
        apply_preference(&mut likes, &mut dislikes, "x", Liked::Yes);
        apply_preference(&mut likes, &mut dislikes, "x", Liked::Yes);
        assert_eq!(likes, vec!["x"]);
        apply_preference(&mut likes, &mut dislikes, "x", Liked::No);
        assert!(likes.is_empty());
        assert_eq!(dislikes, vec!["x"]);
        apply_preference(&mut likes, &mut dislikes, "x", Liked::Unfilled);
        assert!(likes.is_empty() && dislikes.is_empty());
    }

    #[tokio::test]
    async fn in_memory_users_crud_and_paging() {
        let repo = InMemoryUserRepository::new();
        repo.create(User::new("u1", "a@b.com")).await.unwrap();
        repo.create(User::new("u2", "c@d.com")).await.unwrap();
        assert!(matches!(repo.create(User::new("u3", "A@B.com")).await, Err(AppError::Conflict(_))));
        assert!(matches!(repo.create(User::new("u1", "z@z.com")).await, Err(AppError::Conflict(_))));

        let (page, total) = repo.list(ListOptions { page: 1, per_page: 1 }).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        let (page, _) = repo.list(ListOptions { page: 3, per_page: 1 }).await.unwrap();
        assert!(page.is_empty());

        let u = repo.set_preferred_topics("u1", vec!["Music".into()]).await.unwrap();
        assert_eq!(u.preferred_topics, vec!["Music"]);
        repo.push_feedback("u1", "more puns".into()).await.unwrap();
        repo.record_preference("u1", "idea".into(), Liked::No).await.unwrap();
        let u = repo.find_by_clerk_id("u1").await.unwrap();
        assert_eq!(u.feedback, vec!["more puns"]);
        assert_eq!(u.dislikes, vec!["idea"]);
        assert!(matches!(repo.push_feedback("nobody", "x".into()).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn relink_moves_user_to_new_clerk_id() {
        let repo = InMemoryUserRepository::new();
        repo.create(User::new("u_old", "Kim@Example.com")).await.unwrap();
        repo.push_feedback("u_old", "more puns".into()).await.unwrap();
        repo.create(User::new("u_other", "other@example.com")).await.unwrap();

        assert!(matches!(repo.relink_email("kim@example.com", "u_other").await, Err(AppError::Conflict(_))));
        assert!(matches!(repo.relink_email("nobody@example.com", "u_new").await, Err(AppError::NotFound(_))));

        let user = repo.relink_email("kim@example.com", "u_new").await.unwrap();
        assert_eq!(user.clerk_id, "u_new");
        assert_eq!(user.email, "kim@example.com");
        assert_eq!(repo.find_by_clerk_id("u_new").await.unwrap().feedback, vec!["more puns"]);
        assert!(matches!(repo.find_by_clerk_id("u_old").await, Err(AppError::NotFound(_))));
        assert_eq!(repo.list(ListOptions { page: 1, per_page: 10 }).await.unwrap().1, 2);
    }

    #[tokio::test]
    async fn in_memory_feeds_latest_and_like() {
        let repo = InMemoryFeedRepository::new();
        let mut older = Feed::new("u1", ideas(5));
        older.date = older.date - Duration::minutes(5);
        let newer = Feed::new("u1", ideas(5));
        repo.create(older).await.unwrap();
        repo.create(newer.clone()).await.unwrap();
        repo.create(Feed::new("u2", ideas(5))).await.unwrap();

        let (start, end) = crate::models::day_bounds(newer.date);
        let found = repo.latest_between("u1", start, end).await.unwrap().unwrap();
        assert_eq!(found.id, newer.id);
        assert!(repo.latest_between("u1", end, end + Duration::days(1)).await.unwrap().is_none());

        let updated = repo.set_idea_liked(newer.id, "u1", 2, Liked::Yes).await.unwrap();
        assert_eq!(updated.ideas[2].liked, Liked::Yes);
        assert!(matches!(repo.set_idea_liked(newer.id, "u1", 5, Liked::Yes).await, Err(AppError::Validation(_))));
        assert!(matches!(repo.set_idea_liked(newer.id, "u2", 0, Liked::Yes).await, Err(AppError::NotFound(_))));
    }
}
