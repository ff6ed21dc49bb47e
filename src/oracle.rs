//! Disambiguation oracle for ambiguous table-of-contents links.
//!
//! When several discovered files could satisfy one TOC link, the
//! planner may ask an LLM which one the author meant. The oracle is
//! strictly optional and strictly capped: the pipeline is fully
//! functional with `provider = "disabled"`, and an unusable answer
//! simply leaves the link unresolved.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::OracleConfig;

/// Answer to one disambiguation question.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The candidate the oracle chose, if any.
    pub selected_path: Option<String>,
    /// Self-reported confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    pub reason: String,
}

impl Resolution {
    /// The selected path, but only when it names a real candidate and
    /// clears the confidence threshold.
    pub fn accepted(&self, candidates: &[String], threshold: f64) -> Option<String> {
        let selected = self.selected_path.as_ref()?;
        if self.confidence < threshold {
            return None;
        }
        if !candidates.iter().any(|c| c == selected) {
            return None;
        }
        Some(selected.clone())
    }
}

/// Resolver for ambiguous TOC links.
#[async_trait]
pub trait TocResolver: Send + Sync {
    async fn resolve(
        &self,
        label: &str,
        target: &str,
        candidates: &[String],
    ) -> Result<Resolution>;
}

/// Resolver backed by an OpenAI-compatible chat completions endpoint.
///
/// Requires the `ORACLE_API_KEY` environment variable.
pub struct ChatOracle {
    config: OracleConfig,
    api_key: String,
}

impl ChatOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let api_key = std::env::var("ORACLE_API_KEY")
            .map_err(|_| anyhow::anyhow!("ORACLE_API_KEY environment variable not set"))?;
        Ok(Self {
            config: config.clone(),
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        let base = if self.config.base_url.is_empty() {
            "https://api.openai.com"
        } else {
            self.config.base_url.trim_end_matches('/')
        };
        format!("{}/v1/chat/completions", base)
    }
}

/// Instantiate the resolver for the configured provider, or `None` when
/// disabled.
pub fn create_resolver(config: &OracleConfig) -> Result<Option<Box<dyn TocResolver>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Box::new(ChatOracle::new(config)?))),
        other => bail!("Unknown oracle provider: {}", other),
    }
}

#[async_trait]
impl TocResolver for ChatOracle {
    async fn resolve(
        &self,
        label: &str,
        target: &str,
        candidates: &[String],
    ) -> Result<Resolution> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()?;

        let candidate_list = candidates
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "A table of contents links to '{}' with the label '{}'. \
             Several files match:\n{}\n\
             Answer with JSON: {{\"selected_path\": \"<one of the candidates or null>\", \
             \"confidence\": <0.0-1.0>, \"reason\": \"<short>\"}}",
            target, label, candidate_list
        );

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": "You resolve ambiguous documentation links. Reply with a single JSON object and nothing else."},
                {"role": "user", "content": prompt},
            ],
            "temperature": 0,
        });

        let mut last_err = None;

        for attempt in 0..=3u32 {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(self.endpoint())
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Oracle API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Oracle API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Oracle call failed after retries")))
    }
}

/// Pull the JSON answer out of a chat completions response. Tolerates
/// code-fenced answers from models that ignore the format instruction.
fn parse_chat_response(json: &serde_json::Value) -> Result<Resolution> {
    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid oracle response: missing message content"))?;

    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let answer: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| anyhow::anyhow!("Oracle returned non-JSON answer: {}", e))?;

    Ok(Resolution {
        selected_path: answer
            .get("selected_path")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        confidence: answer
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        reason: answer
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<String> {
        vec!["a/intro.md".to_string(), "b/intro.md".to_string()]
    }

    #[test]
    fn accepted_requires_confidence_and_membership() {
        let good = Resolution {
            selected_path: Some("a/intro.md".to_string()),
            confidence: 0.8,
            reason: String::new(),
        };
        assert_eq!(
            good.accepted(&candidates(), 0.6),
            Some("a/intro.md".to_string())
        );

        let timid = Resolution {
            confidence: 0.4,
            ..good.clone()
        };
        assert_eq!(timid.accepted(&candidates(), 0.6), None);

        let stranger = Resolution {
            selected_path: Some("c/other.md".to_string()),
            ..good.clone()
        };
        assert_eq!(stranger.accepted(&candidates(), 0.6), None);

        let silent = Resolution {
            selected_path: None,
            ..good
        };
        assert_eq!(silent.accepted(&candidates(), 0.6), None);
    }

    #[test]
    fn parses_plain_and_fenced_answers() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content":
                "{\"selected_path\": \"a/intro.md\", \"confidence\": 0.9, \"reason\": \"dir matches\"}"}}]
        });
        let resolution = parse_chat_response(&raw).unwrap();
        assert_eq!(resolution.selected_path.as_deref(), Some("a/intro.md"));
        assert!((resolution.confidence - 0.9).abs() < 1e-9);

        let fenced = serde_json::json!({
            "choices": [{"message": {"content":
                "```json\n{\"selected_path\": \"b/intro.md\", \"confidence\": 0.7, \"reason\": \"\"}\n```"}}]
        });
        let resolution = parse_chat_response(&fenced).unwrap();
        assert_eq!(resolution.selected_path.as_deref(), Some("b/intro.md"));
    }

    #[test]
    fn garbage_answer_is_an_error() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": "I think it's probably the first one."}}]
        });
        assert!(parse_chat_response(&raw).is_err());
    }

    #[test]
    fn disabled_provider_yields_no_resolver() {
        let resolver = create_resolver(&OracleConfig::default()).unwrap();
        assert!(resolver.is_none());
    }
}
