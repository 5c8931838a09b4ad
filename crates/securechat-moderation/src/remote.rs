use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use securechat_types::moderation::{Analysis, RiskLevel};
use thiserror::Error;
use tracing::debug;

/// Bounded timeout for the remote call; on expiry the caller falls back to
/// heuristics rather than failing the send.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const SYSTEM_PROMPT: &str = "You are a cybersecurity expert specialized in detecting dangerous messages.

Analyze the following message and determine whether it contains:
- Spam (unsolicited advertising, too-good-to-be-true offers)
- Phishing (attempts to steal personal information, passwords, banking details)
- Malicious links (suspicious, shortened, or raw-IP URLs)
- Inappropriate content (harassment, threats, offensive content)

Respond ONLY with a valid JSON object with this exact structure:
{
  \"isSpam\": boolean,
  \"isPhishing\": boolean,
  \"hasMaliciousLinks\": boolean,
  \"isInappropriate\": boolean,
  \"riskScore\": number (0-100),
  \"riskLevel\": \"SAFE\" | \"LOW\" | \"MEDIUM\" | \"HIGH\",
  \"detectedIssues\": [\"list\", \"of\", \"issues\"],
  \"suggestions\": [\"list\", \"of\", \"advice\"],
  \"explanation\": \"Short explanation of the risk\"
}";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed classifier response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
}

impl RemoteConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Classification via an OpenAI-compatible chat-completions endpoint.
pub struct RemoteClassifier {
    http: reqwest::Client,
    config: RemoteConfig,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl RemoteClassifier {
    pub fn new(config: RemoteConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self { http, config }
    }

    pub async fn classify(&self, message: &str) -> Result<Analysis, RemoteError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": message },
            ],
            "temperature": 0.3,
            "max_tokens": 500,
        });

        let response: ChatResponse = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| RemoteError::MalformedResponse("empty choices".to_string()))?;

        debug!("Remote classifier raw response: {}", content);
        parse_analysis(content)
    }
}

/// Defensive parse of the model output: markdown fences are tolerated,
/// anything that still fails to fit the Analysis shape is an error (which
/// triggers the heuristic fallback upstream), and the risk level is
/// recomputed from the clamped score so the two can never disagree.
pub fn parse_analysis(content: &str) -> Result<Analysis, RemoteError> {
    let cleaned = content
        .replace("```json", "")
        .replace("```", "")
        .trim()
        .to_string();

    let mut analysis: Analysis = serde_json::from_str(&cleaned)
        .map_err(|e| RemoteError::MalformedResponse(e.to_string()))?;

    analysis.risk_level = RiskLevel::from_score(analysis.risk_score);
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_model_output() {
        let content = r#"```json
{"isSpam": true, "riskScore": 45, "detectedIssues": ["Unsolicited offer"]}
```"#;
        let analysis = parse_analysis(content).unwrap();
        assert!(analysis.is_spam);
        assert_eq!(analysis.risk_score, 45);
        assert_eq!(analysis.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn risk_level_is_recomputed_from_score() {
        // A backend reporting an inconsistent level is corrected.
        let content = r#"{"riskScore": 85, "riskLevel": "SAFE"}"#;
        let analysis = parse_analysis(content).unwrap();
        assert_eq!(analysis.risk_level, RiskLevel::High);
    }

    #[test]
    fn free_form_prose_is_a_parse_failure() {
        let content = "I think this message is probably fine.";
        assert!(parse_analysis(content).is_err());
    }
}
