use regex::RegexSet;
use securechat_types::moderation::{Analysis, RiskLevel};

/// Fixed score contribution per matched category.
const PHISHING_SCORE: u8 = 50;
const SPAM_SCORE: u8 = 30;
const MALICIOUS_LINK_SCORE: u8 = 40;

/// Deterministic pattern-based classifier. Also serves as the fallback
/// whenever the remote backend is missing or misbehaves.
///
/// Each category contributes a fixed score at most once, regardless of how
/// many of its patterns match; contributions accumulate and are clamped to
/// 100 so threshold comparisons stay deterministic.
pub struct HeuristicClassifier {
    phishing: RegexSet,
    spam: RegexSet,
    malicious_links: RegexSet,
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self {
            phishing: RegexSet::new([
                r"(?i)click\s+here",
                r"(?i)verify\s+your\s+account",
                r"(?i)update\s+(your\s+)?payment",
                r"(?i)act\s+now",
            ])
            .expect("phishing patterns must compile"),
            spam: RegexSet::new([
                r"(?i)free\s+money",
                r"(?i)guaranteed\s+income",
                r"(?i)investment\s+opportunity",
            ])
            .expect("spam patterns must compile"),
            malicious_links: RegexSet::new([
                r"(?i)bit\.ly|tinyurl|short\.link",
                r"https?://\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}",
            ])
            .expect("link patterns must compile"),
        }
    }

    pub fn classify(&self, message: &str) -> Analysis {
        let mut analysis = Analysis::default();
        let mut score: u16 = 0;

        if self.phishing.is_match(message) {
            analysis.is_phishing = true;
            analysis
                .detected_issues
                .push("Possible phishing attempt".to_string());
            score += PHISHING_SCORE as u16;
        }

        if self.spam.is_match(message) {
            analysis.is_spam = true;
            analysis
                .detected_issues
                .push("Spam content detected".to_string());
            score += SPAM_SCORE as u16;
        }

        if self.malicious_links.is_match(message) {
            analysis.has_malicious_links = true;
            analysis
                .detected_issues
                .push("Suspicious links detected".to_string());
            score += MALICIOUS_LINK_SCORE as u16;
        }

        analysis.risk_score = score.min(100) as u8;
        analysis.risk_level = RiskLevel::from_score(analysis.risk_score);
        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_message_is_safe() {
        let classifier = HeuristicClassifier::new();
        let analysis = classifier.classify("Hey, are we still meeting at 5?");

        assert_eq!(analysis.risk_score, 0);
        assert_eq!(analysis.risk_level, RiskLevel::Safe);
        assert!(analysis.detected_issues.is_empty());
    }

    #[test]
    fn phishing_phrase_scores_at_least_fifty() {
        let classifier = HeuristicClassifier::new();
        let analysis = classifier.classify("Please verify your account today");

        assert!(analysis.is_phishing);
        assert!(analysis.risk_score >= 50);
        assert!(!analysis.detected_issues.is_empty());
    }

    #[test]
    fn spam_plus_phishing_crosses_the_block_threshold() {
        let classifier = HeuristicClassifier::new();
        let analysis = classifier.classify("Free money! Click here now!");

        assert!(analysis.is_spam);
        assert!(analysis.is_phishing);
        assert!(analysis.risk_score >= crate::BLOCK_THRESHOLD);
        assert_eq!(analysis.risk_level, RiskLevel::High);
    }

    #[test]
    fn accumulated_score_is_clamped_to_one_hundred() {
        let classifier = HeuristicClassifier::new();
        let analysis = classifier
            .classify("Free money! Click here to verify your account: http://10.0.0.1/login");

        assert!(analysis.is_spam && analysis.is_phishing && analysis.has_malicious_links);
        assert_eq!(analysis.risk_score, 100);
    }

    #[test]
    fn url_shorteners_are_flagged() {
        let classifier = HeuristicClassifier::new();
        let analysis = classifier.classify("check this out https://bit.ly/3xyz");

        assert!(analysis.has_malicious_links);
        assert_eq!(analysis.risk_score, 40);
        assert_eq!(analysis.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn each_category_contributes_once() {
        let classifier = HeuristicClassifier::new();
        let analysis = classifier.classify("free money and guaranteed income");

        assert_eq!(analysis.risk_score, 30);
        assert_eq!(analysis.detected_issues.len(), 1);
    }
}
