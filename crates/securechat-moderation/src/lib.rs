//! Content-risk classification for the moderation gate.
//!
//! Two interchangeable backends produce the same [`Analysis`] shape: a
//! remote language-model call and a deterministic heuristic. The remote
//! backend is used when a credential is configured, but any transport
//! error, timeout, or malformed response falls back to the heuristic so
//! that moderation never becomes a single point of failure for delivery.
//! Block/warn/allow thresholding on the resulting score is the caller's
//! job, not the classifier's.

pub mod heuristic;
pub mod remote;

use securechat_types::moderation::Analysis;
use tracing::warn;

pub use heuristic::HeuristicClassifier;
pub use remote::{RemoteClassifier, RemoteConfig};

/// Score at or above which a send is blocked outright.
pub const BLOCK_THRESHOLD: u8 = 70;
/// Score at or above which a send is persisted but flagged to the sender.
pub const WARN_THRESHOLD: u8 = 40;

pub struct RiskClassifier {
    heuristic: HeuristicClassifier,
    remote: Option<RemoteClassifier>,
}

impl RiskClassifier {
    pub fn new(remote: Option<RemoteConfig>) -> Self {
        Self {
            heuristic: HeuristicClassifier::new(),
            remote: remote.map(RemoteClassifier::new),
        }
    }

    /// Heuristic-only classifier, the default when no remote credential is
    /// configured.
    pub fn heuristic_only() -> Self {
        Self::new(None)
    }

    pub async fn classify(&self, message: &str) -> Analysis {
        if let Some(remote) = &self.remote {
            match remote.classify(message).await {
                Ok(analysis) => return analysis,
                Err(e) => {
                    warn!("Remote classifier unavailable, falling back to heuristics: {}", e);
                }
            }
        }
        self.heuristic.classify(message)
    }
}

/// Canned security advice derived from the analysis categories, plus any
/// suggestions the remote backend produced. Pure function of the analysis.
pub fn security_tips(analysis: &Analysis) -> Vec<String> {
    let mut tips = Vec::new();

    if analysis.is_phishing {
        tips.push("Never share passwords or banking details in chat".to_string());
        tips.push("Verify the sender before clicking any link".to_string());
    }
    if analysis.has_malicious_links {
        tips.push("Hover over links to see their real destination".to_string());
        tips.push("Keep your antivirus up to date".to_string());
    }
    if analysis.is_spam {
        tips.push("Report this message as spam".to_string());
        tips.push("Do not reply to spam messages".to_string());
    }
    if analysis.is_inappropriate {
        tips.push("Report this behavior to a moderator".to_string());
        tips.push("Block this user if necessary".to_string());
    }

    tips.extend(analysis.suggestions.iter().cloned());
    tips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tips_follow_the_detected_categories() {
        let analysis = Analysis {
            is_phishing: true,
            suggestions: vec!["Change your password".to_string()],
            ..Default::default()
        };

        let tips = security_tips(&analysis);
        assert!(tips.iter().any(|t| t.contains("passwords")));
        assert_eq!(tips.last().unwrap(), "Change your password");
    }

    #[test]
    fn clean_analysis_yields_no_tips() {
        assert!(security_tips(&Analysis::default()).is_empty());
    }

    #[tokio::test]
    async fn classifier_without_remote_uses_heuristics() {
        let classifier = RiskClassifier::heuristic_only();
        let analysis = classifier.classify("free money, guaranteed income!").await;
        assert!(analysis.is_spam);
    }
}
