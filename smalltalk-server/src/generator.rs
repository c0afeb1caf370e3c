//! Feed generation adapter: turns a user's preference signal into a prompt,
//! asks the generative text API for five openers, and cleans up the answer.

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::GeneratorConfig;
use crate::models::{AppError, Idea, Liked, PreferenceSignal};

/// Ideas per feed.
pub const FEED_SIZE: usize = 5;

const DEVELOPER_PROMPT: &str = "You are creative conversation opener generator that runs every morning. \
Suggest five daily creative, engaging and fresh conversation openers that can be used in a variety of casual social situations. \
Each opener should be appropriate for general adult audiences and not assume prior familiarity between speakers. \
The conversation openers should take into account latest news, events, weather and other trending topics relevant to the user. \
The topics should be very casual, potentially humorous and appropriate for quick casual social situations.";

#[async_trait]
pub trait FeedGenerator: Send + Sync {
    async fn generate(&self, signal: &PreferenceSignal) -> Result<Vec<Idea>, AppError>;
}

/// `* item` per line.
pub fn bulleted_list(items: &[String]) -> String {
    items.iter().map(|i| format!("* {}", i)).collect::<Vec<_>>().join("\n")
}

pub fn build_user_prompt(signal: &PreferenceSignal, city: &str) -> String {
    format!(
        "The user lives in {city}. Here are their preferred topics: {topics}.\n\n\
         Take into account that the user has previously liked the following ideas:\n{likes}\n\n\
         Take into account that the user has also previously disliked the following ideas:\n{dislikes}\n\n\
         Also take into account the direct feedback below provided by the user:\n{feedback}\n",
        topics = signal.preferred_topics.join(", "),
        likes = bulleted_list(&signal.likes),
        dislikes = bulleted_list(&signal.dislikes),
        feedback = bulleted_list(&signal.feedback),
    )
}

static CITATION_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x{e200}cite.*?\x{e201}|【\d+(?::\d+)?†[^】]*】").expect("citation regex is valid")
});

/// Strips inline web-search citation markers left in generated text.
pub fn remove_citations(text: &str) -> String {
    CITATION_MARKERS.replace_all(text, "").trim().to_string()
}

fn idea_list_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "ideas": {
                "type": "array",
                "description": "A list of five ideas.",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string", "description": "Short headline for the idea.", "minLength": 1 },
                        "description": { "type": "string", "description": "A description of the idea.", "minLength": 1 }
                    },
                    "required": ["title", "description"],
                    "additionalProperties": false
                },
                "minItems": FEED_SIZE,
                "maxItems": FEED_SIZE
            }
        },
        "required": ["ideas"],
        "additionalProperties": false
    })
}

#[derive(Debug, Deserialize)]
struct RawIdeaList {
    ideas: Vec<RawIdea>,
}

#[derive(Debug, Deserialize)]
struct RawIdea {
    title: String,
    description: String,
}

/// Pulls the text answer out of a Responses API payload.
fn output_text(resp: &Value) -> Option<String> {
    if let Some(text) = resp.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    let text: String = resp
        .get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|c| c.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|c| c.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

/// Parses the structured answer into ideas ready to store.
pub fn parse_ideas(resp: &Value) -> Result<Vec<Idea>, AppError> {
    let text = output_text(resp).ok_or_else(|| AppError::Upstream("generator returned no text output".into()))?;
    let raw: RawIdeaList = serde_json::from_str(&text)
        .map_err(|e| AppError::Upstream(format!("generator returned malformed ideas: {}", e)))?;
    let ideas: Vec<Idea> = raw
        .ideas
        .into_iter()
        .map(|r| Idea { title: remove_citations(&r.title), description: remove_citations(&r.description), liked: Liked::Unfilled })
        .filter(|i| !i.title.is_empty() && !i.description.is_empty())
        .collect();
    if ideas.len() != FEED_SIZE {
        return Err(AppError::Upstream(format!("generator returned {} usable ideas, expected {}", ideas.len(), FEED_SIZE)));
    }
    Ok(ideas)
}

/// Calls the OpenAI Responses API with web search enabled.
#[derive(Clone)]
pub struct OpenAiFeedGenerator {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    city: String,
    country: String,
}

impl OpenAiFeedGenerator {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, api_key)
    }

    pub fn with_client(http: reqwest::Client, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: "gpt-5-mini".into(),
            city: "London".into(),
            country: "GB".into(),
        }
    }

    pub fn from_config(cfg: &GeneratorConfig, timeout: Duration) -> Result<Self, AppError> {
        let api_key = cfg.api_key.clone().ok_or_else(|| AppError::Config("OPENAI_API_KEY is required".into()))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            model: cfg.model.clone(),
            city: cfg.city.clone(),
            country: cfg.country.clone(),
            ..Self::with_client(http, cfg.api_url.clone(), api_key)
        })
    }

    pub fn request_body(&self, signal: &PreferenceSignal) -> Value {
        json!({
            "model": self.model,
            "input": [
                { "role": "developer", "content": [{ "type": "input_text", "text": DEVELOPER_PROMPT }] },
                { "role": "user", "content": [{ "type": "input_text", "text": build_user_prompt(signal, &self.city) }] }
            ],
            "text": {
                "format": { "type": "json_schema", "name": "idea_list", "strict": true, "schema": idea_list_schema() },
                "verbosity": "medium"
            },
            "reasoning": { "effort": "low", "summary": "auto" },
            "tools": [{
                "type": "web_search",
                "search_context_size": "medium",
                "user_location": { "type": "approximate", "country": self.country }
            }],
            "store": true
        })
    }
}

#[async_trait]
impl FeedGenerator for OpenAiFeedGenerator {
    async fn generate(&self, signal: &PreferenceSignal) -> Result<Vec<Idea>, AppError> {
        let resp = self
            .http
            .post(format!("{}/v1/responses", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(signal))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!("generator returned {}: {}", status, body)));
        }
        let payload: Value = resp.json().await?;
        let ideas = parse_ideas(&payload)?;
        tracing::debug!(count = ideas.len(), model = %self.model, "generated ideas");
        Ok(ideas)
    }
}
