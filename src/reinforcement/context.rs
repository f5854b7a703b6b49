// Context encoding for the learning state space
// Maps situational features to a stable, collision-resistant identifier

use once_cell::sync::Lazy;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};

/// Version of the stop-word list below. Bump when the list changes so that
/// contexts hashed against an older list are not conflated with new ones.
pub const STOPWORDS_VERSION: u32 = 1;

const STOPWORD_LIST: &[&str] = &[
    "a", "about", "after", "all", "an", "and", "any", "are", "as", "at", "be", "been", "but", "by",
    "can", "could", "did", "do", "does", "for", "from", "had", "has", "have", "how", "i", "if",
    "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on", "or", "our", "out",
    "please", "should", "so", "than", "that", "the", "their", "them", "then", "there", "these",
    "they", "this", "to", "up", "us", "was", "we", "were", "what", "when", "where", "which", "who",
    "will", "with", "would", "you", "your",
];

static STOPWORDS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| STOPWORD_LIST.iter().copied().collect());

/// Coarse session-depth bucket, bounding state-space growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepBucket {
    /// First call of the session
    FirstCall,
    /// Steps 1-3
    Early,
    /// Step 4 and beyond
    Deep,
}

impl StepBucket {
    pub fn from_step(step: u32) -> Self {
        match step {
            0 => StepBucket::FirstCall,
            1..=3 => StepBucket::Early,
            _ => StepBucket::Deep,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepBucket::FirstCall => "first",
            StepBucket::Early => "early",
            StepBucket::Deep => "deep",
        }
    }
}

/// Normalize free text into a case-folded, stop-word-filtered,
/// order-independent keyword set, returned sorted.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut keywords = BTreeSet::new();
    for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
        if token.len() < 2 || STOPWORDS.contains(token) {
            continue;
        }
        keywords.insert(token.to_string());
    }
    keywords.into_iter().collect()
}

#[derive(Serialize)]
struct CanonicalContext<'a> {
    keywords: &'a [String],
    previous_tool: &'a str,
    step_bucket: &'a str,
}

/// Encode situational features into an opaque stable state identifier.
///
/// The same canonical input yields the same id every time, across process
/// restarts: keywords are sorted, struct fields serialize in declaration
/// order, and the digest is SHA-256.
pub fn encode_context(intent: Option<&str>, previous_tool: Option<&str>, step_count: u32) -> String {
    let keywords = tokenize(intent.unwrap_or(""));
    let canonical = CanonicalContext {
        keywords: &keywords,
        previous_tool: previous_tool.unwrap_or(""),
        step_bucket: StepBucket::from_step(step_count).as_str(),
    };

    let payload =
        serde_json::to_string(&canonical).expect("canonical context serialization cannot fail");
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_folds_case_and_filters_stopwords() {
        let keywords = tokenize("Show me the Consolidation status for THE entity");
        assert_eq!(keywords, vec!["consolidation", "entity", "show", "status"]);
    }

    #[test]
    fn tokenize_drops_short_tokens_and_punctuation() {
        let keywords = tokenize("FX: re-run a P&L rollup!");
        assert_eq!(keywords, vec!["fx", "re", "rollup", "run"]);
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = encode_context(Some("retrieve entity balances"), Some("get_members"), 2);
        let b = encode_context(Some("retrieve entity balances"), Some("get_members"), 2);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn encoding_is_invariant_to_keyword_order() {
        let a = encode_context(Some("retrieve entity balances"), None, 0);
        let b = encode_context(Some("balances entity retrieve"), None, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn stopwords_do_not_change_the_id() {
        let a = encode_context(Some("the entity balances"), None, 0);
        let b = encode_context(Some("entity balances"), None, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_features_change_the_id() {
        let base = encode_context(Some("entity balances"), None, 0);
        assert_ne!(
            base,
            encode_context(Some("journal entries"), None, 0),
            "different keywords"
        );
        assert_ne!(
            base,
            encode_context(Some("entity balances"), Some("get_members"), 0),
            "different previous tool"
        );
        assert_ne!(
            base,
            encode_context(Some("entity balances"), None, 1),
            "different step bucket"
        );
    }

    #[test]
    fn steps_collapse_into_buckets() {
        assert_eq!(StepBucket::from_step(0), StepBucket::FirstCall);
        assert_eq!(StepBucket::from_step(1), StepBucket::Early);
        assert_eq!(StepBucket::from_step(3), StepBucket::Early);
        assert_eq!(StepBucket::from_step(4), StepBucket::Deep);
        assert_eq!(StepBucket::from_step(40), StepBucket::Deep);

        // Steps in the same bucket share an id.
        let a = encode_context(Some("entity balances"), None, 4);
        let b = encode_context(Some("entity balances"), None, 40);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_intent_encodes() {
        let a = encode_context(None, None, 0);
        let b = encode_context(Some(""), None, 0);
        assert_eq!(a, b);
    }
}
