//! Daily email: HTML rendering of a feed and delivery through Resend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::EmailConfig;
use crate::models::{AppError, Idea};

pub const APP_URL: &str = "https://smalltalk.fun/";

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, html: &str) -> Result<(), AppError>;
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders the ideas as an inline-styled HTML email body.
pub fn format_email_html(ideas: &[Idea]) -> String {
    if ideas.is_empty() {
        return r#"<p style="font-family: Arial, sans-serif; color: #000;">No content available.</p>"#.to_string();
    }
    let items: String = ideas
        .iter()
        .map(|idea| {
            format!(
                r#"
      <li style="margin-bottom: 10px;">
          <strong style="font-weight: bold; font-size: 14px;">{}</strong>
          <p style="margin-top: 5px; margin-bottom: 5px; color: #333; font-size: 12px; line-height: 1.5;">{}</p>
      </li>"#,
                escape_html(&idea.title),
                escape_html(&idea.description)
            )
        })
        .collect();
    format!(
        r#"<div style="font-family: Arial, sans-serif; color: #000000;">
    <h1 style="color: rgb(160, 0, 0); font-size: 20px; margin: 0 0 15px 0;">Daily Topics</h1>
    <ul style="list-style-type: disc; margin: 0; padding: 0 0 0 20px;">{items}
    </ul>
    <a href="{APP_URL}" style="margin-top: 15px; font-size: 12px; color: rgb(27, 0, 165);">Small Talk App</a>
</div>"#
    )
}

#[derive(Clone)]
pub struct ResendMailer {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
    subject: String,
}

impl ResendMailer {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, api_key, from)
    }

    pub fn with_client(http: reqwest::Client, api_url: impl Into<String>, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            from: from.into(),
            subject: "Your Daily Topics".into(),
        }
    }

    pub fn from_config(cfg: &EmailConfig, timeout: Duration) -> Result<Self, AppError> {
        let api_key = cfg.api_key.clone().ok_or_else(|| AppError::Config("RESEND_API_KEY is required".into()))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { subject: cfg.subject.clone(), ..Self::with_client(http, cfg.api_url.clone(), api_key, cfg.from.clone()) })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, to: &str, html: &str) -> Result<(), AppError> {
        let resp = self
            .http
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "from": self.from, "to": [to], "subject": self.subject, "html": html }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!("email provider returned {}: {}", status, body)));
        }
        Ok(())
    }
}

/// Accepts every message and does nothing; used when no email key is configured.
#[derive(Debug, Default, Clone)]
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, to: &str, _html: &str) -> Result<(), AppError> {
        tracing::debug!(to, "email delivery disabled; dropping message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn empty_feed_renders_placeholder() {
        assert!(format_email_html(&[]).contains("No content available."));
    }

    #[test]
    fn renders_escaped_ideas() {
        let html = format_email_html(&[Idea::new("Fish & Chips", "Is <b>vinegar</b> essential?")]);
        assert!(html.contains("Daily Topics"));
        assert!(html.contains("Fish &amp; Chips"));
        assert!(html.contains("Is &lt;b&gt;vinegar&lt;/b&gt; essential?"));
        assert!(html.contains(APP_URL));
        assert_eq!(html.matches("<li").count(), 1);
    }

    #[tokio::test]
    async fn sends_through_resend() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/emails")
                .header("authorization", "Bearer re_test")
                .json_body(serde_json::json!({
                    "from": "Small Talk <dailyfeed@smalltalk.fun>",
                    "to": ["a@b.com"],
                    "subject": "Your Daily Topics",
                    "html": "<p>hi</p>"
                }));
            then.status(200).json_body(serde_json::json!({ "id": "email_1" }));
        });
        let mailer = ResendMailer::new(server.base_url(), "re_test", "Small Talk <dailyfeed@smalltalk.fun>");
        mailer.send("a@b.com", "<p>hi</p>").await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn rejected_sends_are_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/emails");
            then.status(422).body("invalid from");
        });
        let mailer = ResendMailer::new(server.base_url(), "re_test", "bad");
        assert!(matches!(mailer.send("a@b.com", "x").await, Err(AppError::Upstream(_))));
    }

    fn email_config(api_url: String, api_key: Option<&str>) -> EmailConfig {
        EmailConfig {
            api_url,
            api_key: api_key.map(String::from),
            from: "Digest <digest@smalltalk.fun>".into(),
            subject: "Morning openers".into(),
        }
    }

    #[test]
    fn from_config_requires_api_key() {
        let cfg = email_config("http://localhost".into(), None);
        assert!(matches!(ResendMailer::from_config(&cfg, Duration::from_secs(5)), Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn from_config_sends_with_configured_sender_and_subject() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/emails")
                .header("authorization", "Bearer re_cfg")
                .json_body(serde_json::json!({
                    "from": "Digest <digest@smalltalk.fun>",
                    "to": ["a@b.com"],
                    "subject": "Morning openers",
                    "html": "<p>hi</p>"
                }));
            then.status(200).json_body(serde_json::json!({ "id": "email_2" }));
        });
        let cfg = email_config(server.base_url(), Some("re_cfg"));
        let mailer = ResendMailer::from_config(&cfg, Duration::from_secs(5)).unwrap();
        mailer.send("a@b.com", "<p>hi</p>").await.unwrap();
        mock.assert();
    }
}
