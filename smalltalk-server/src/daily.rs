//! Daily batch: regenerate and email a feed for every registered user.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::email::{format_email_html, Mailer};
use crate::generator::FeedGenerator;
use crate::models::{AppError, Feed, User};
use crate::repository::{FeedRepository, ListOptions, UserRepository};

/// Generates a fresh feed from the user's current preference signal and stores it.
pub async fn generate_feed_for(generator: &dyn FeedGenerator, feeds: &dyn FeedRepository, user: &User) -> Result<Feed, AppError> {
    let ideas = generator.generate(&user.preference_signal()).await?;
    feeds.create(Feed::new(user.clerk_id.clone(), ideas)).await
}

/// Outcome counts of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyReport {
    /// Users whose feed was generated and stored.
    pub processed: usize,
    pub emailed: usize,
    pub failed: usize,
}

enum UserOutcome {
    Emailed,
    StoredOnly,
    Failed,
}

#[derive(Clone)]
pub struct DailyTask {
    pub users: Arc<dyn UserRepository>,
    pub feeds: Arc<dyn FeedRepository>,
    pub generator: Arc<dyn FeedGenerator>,
    pub mailer: Arc<dyn Mailer>,
    pub batch_limit: usize,
    pub page_size: u32,
}

impl DailyTask {
    /// Walks every user page by page; up to `batch_limit` users of a page run at once.
    /// A failing user is logged and skipped.
    pub async fn run(&self) -> Result<DailyReport, AppError> {
        let semaphore = Arc::new(Semaphore::new(self.batch_limit.max(1)));
        let mut report = DailyReport::default();
        let mut page = 1;
        loop {
            let opts = ListOptions { page, per_page: self.page_size }.clamp(1000);
            let (users, total) = self.users.list(opts).await?;
            if users.is_empty() {
                break;
            }
            let futures = users.iter().map(|user| {
                let semaphore = semaphore.clone();
                async move {
                    let Ok(_permit) = semaphore.acquire().await else { return UserOutcome::Failed };
                    self.process_user(user).await
                }
            });
            for outcome in join_all(futures).await {
                match outcome {
                    UserOutcome::Emailed => { report.processed += 1; report.emailed += 1; }
                    UserOutcome::StoredOnly => report.processed += 1,
                    UserOutcome::Failed => report.failed += 1,
                }
            }
            if (page as usize).saturating_mul(opts.per_page as usize) >= total {
                break;
            }
            page += 1;
        }
        tracing::info!(processed = report.processed, emailed = report.emailed, failed = report.failed, "daily task completed");
        Ok(report)
    }

    async fn process_user(&self, user: &User) -> UserOutcome {
        tracing::info!(clerk_id = %user.clerk_id, email = %user.email, "processing user");
        let feed = match generate_feed_for(self.generator.as_ref(), self.feeds.as_ref(), user).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(clerk_id = %user.clerk_id, error = %e, "feed generation failed");
                return UserOutcome::Failed;
            }
        };
        match self.mailer.send(&user.email, &format_email_html(&feed.ideas)).await {
            Ok(()) => UserOutcome::Emailed,
            Err(e) => {
                tracing::error!(clerk_id = %user.clerk_id, error = %e, "daily email failed");
                UserOutcome::StoredOnly
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Idea, PreferenceSignal};
    use crate::repository::RepositoryFactory;
    use async_trait::async_trait;
    use chrono::Duration;
    use tokio::sync::Mutex;

    struct FixedGenerator;

    #[async_trait]
    impl FeedGenerator for FixedGenerator {
        async fn generate(&self, signal: &PreferenceSignal) -> Result<Vec<Idea>, AppError> {
            if signal.preferred_topics.iter().any(|t| t == "Broken") {
                return Err(AppError::Upstream("boom".into()));
            }
            Ok((0..5).map(|i| Idea::new(format!("t{}", i), signal.preferred_topics.join(","))).collect())
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, to: &str, _html: &str) -> Result<(), AppError> {
            if to.starts_with("bounce") {
                return Err(AppError::Upstream("rejected".into()));
            }
            self.sent.lock().await.push(to.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn processes_every_user_across_pages() {
        let (users, feeds) = RepositoryFactory::in_memory();
        let mailer = Arc::new(RecordingMailer::default());
        for i in 0..5 {
            let mut u = User::new(format!("u{}", i), format!("u{}@example.com", i));
            u.created_at = u.created_at + Duration::seconds(i);
            users.create(u).await.unwrap();
        }
        let mut broken = User::new("broken", "broken@example.com");
        broken.preferred_topics = vec!["Broken".into()];
        users.create(broken).await.unwrap();
        users.create(User::new("bouncy", "bounce@example.com")).await.unwrap();

        let task = DailyTask { users, feeds: feeds.clone(), generator: Arc::new(FixedGenerator), mailer: mailer.clone(), batch_limit: 2, page_size: 2 };
        let report = task.run().await.unwrap();
        assert_eq!(report, DailyReport { processed: 6, emailed: 5, failed: 1 });
        assert_eq!(mailer.sent.lock().await.len(), 5);

        let (start, end) = crate::models::day_bounds(crate::models::now());
        assert!(feeds.latest_between("bouncy", start, end).await.unwrap().is_some());
        assert!(feeds.latest_between("broken", start, end).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_user_base_is_a_no_op() {
        let (users, feeds) = RepositoryFactory::in_memory();
        let task = DailyTask { users, feeds, generator: Arc::new(FixedGenerator), mailer: Arc::new(RecordingMailer::default()), batch_limit: 1, page_size: 10 };
        assert_eq!(task.run().await.unwrap(), DailyReport::default());
    }
}
