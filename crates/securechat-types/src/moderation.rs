use serde::{Deserialize, Serialize};

/// Risk bands derived from the 0-100 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        if score >= 70 {
            RiskLevel::High
        } else if score >= 40 {
            RiskLevel::Medium
        } else if score >= 20 {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }
}

/// Structured classification of a plaintext message.
///
/// The remote backend is asked to produce exactly this shape as JSON; the
/// heuristic backend builds it directly. Unknown or missing fields from the
/// remote side are defaulted rather than rejected, which keeps a slightly
/// off-shape remote answer usable instead of triggering the fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    #[serde(default)]
    pub is_spam: bool,
    #[serde(default)]
    pub is_phishing: bool,
    #[serde(default)]
    pub has_malicious_links: bool,
    #[serde(default)]
    pub is_inappropriate: bool,
    #[serde(default, deserialize_with = "clamped_score")]
    pub risk_score: u8,
    #[serde(default = "default_level")]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub detected_issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub explanation: String,
}

fn default_level() -> RiskLevel {
    RiskLevel::Safe
}

/// Remote backends occasionally report scores outside 0-100; clamp on the
/// way in so threshold comparisons stay deterministic.
fn clamped_score<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(raw.clamp(0.0, 100.0) as u8)
}

impl Default for Analysis {
    fn default() -> Self {
        Self {
            is_spam: false,
            is_phishing: false,
            has_malicious_links: false,
            is_inappropriate: false,
            risk_score: 0,
            risk_level: RiskLevel::Safe,
            detected_issues: Vec::new(),
            suggestions: Vec::new(),
            explanation: String::new(),
        }
    }
}

/// Outcome recorded in the moderation log for every classified send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModerationAction {
    Blocked,
    Warned,
    Allowed,
}

impl ModerationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationAction::Blocked => "BLOCKED",
            ModerationAction::Warned => "WARNED",
            ModerationAction::Allowed => "ALLOWED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_thresholds() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Safe);
        assert_eq!(RiskLevel::from_score(19), RiskLevel::Safe);
        assert_eq!(RiskLevel::from_score(20), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(40), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(69), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(70), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::High);
    }

    #[test]
    fn analysis_parses_partial_json() {
        let analysis: Analysis =
            serde_json::from_str(r#"{"isPhishing": true, "riskScore": 55}"#).unwrap();
        assert!(analysis.is_phishing);
        assert!(!analysis.is_spam);
        assert_eq!(analysis.risk_score, 55);
        assert!(analysis.detected_issues.is_empty());
    }

    #[test]
    fn analysis_clamps_out_of_range_score() {
        let analysis: Analysis = serde_json::from_str(r#"{"riskScore": 140}"#).unwrap();
        assert_eq!(analysis.risk_score, 100);
    }
}
