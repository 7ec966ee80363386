//! Set-theoretic duplicate detection for decision summaries.
//!
//! Two cheap, deterministic measures over significant word tokens: Jaccard
//! similarity catches rephrasings of similar length, containment catches a
//! short summary subsumed by a longer stored one. Either crossing its
//! threshold marks the candidate as a duplicate.

use std::collections::HashSet;

/// Significant tokens: lowercased, non-alphanumerics stripped, length > 3.
/// Stripping (not splitting) matters: a contraction collapses into one
/// token ("we've" becomes "weve"), it does not shed letters into the set.
pub fn tokenize(summary: &str) -> HashSet<String> {
    summary
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of the token sets. Two empty sets are identical (1.0).
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Containment: shared tokens over the smaller set.
pub fn containment(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / smaller as f64
}

/// Whether `candidate` duplicates any of `stored` under the thresholds.
pub fn is_duplicate(
    candidate: &str,
    stored: &[String],
    jaccard_threshold: f64,
    containment_threshold: f64,
) -> bool {
    let candidate_tokens = tokenize(candidate);
    stored.iter().any(|existing| {
        let existing_tokens = tokenize(existing);
        jaccard(&candidate_tokens, &existing_tokens) >= jaccard_threshold
            || containment(&candidate_tokens, &existing_tokens) >= containment_threshold
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{DEFAULT_CONTAINMENT_THRESHOLD, DEFAULT_JACCARD_THRESHOLD};

    fn dup(candidate: &str, stored: &str) -> bool {
        is_duplicate(
            candidate,
            &[stored.to_string()],
            DEFAULT_JACCARD_THRESHOLD,
            DEFAULT_CONTAINMENT_THRESHOLD,
        )
    }

    #[test]
    fn tokens_drop_short_words_and_punctuation() {
        let tokens = tokenize("We'll migrate to Postgres by Q3!");
        assert!(tokens.contains("migrate"));
        assert!(tokens.contains("postgres"));
        assert!(!tokens.contains("to"));
        assert!(!tokens.contains("q3"));
    }

    #[test]
    fn contractions_collapse_into_one_token() {
        let tokens = tokenize("We've decided");
        assert!(tokens.contains("weve"));
        assert!(tokens.contains("decided"));
        assert_eq!(tokens.len(), 2);
    }

    /// Rephrasing with enough new words passes both gates.
    #[test]
    fn light_rephrasing_is_accepted() {
        assert!(!dup(
            "We've decided to migrate to Postgres in Q3",
            "We will migrate to Postgres by Q3",
        ));
    }

    /// Near-identical wording trips the Jaccard gate.
    #[test]
    fn heavy_overlap_is_rejected() {
        assert!(dup(
            "We will migrate to Postgres before Q3 ends",
            "We will migrate to Postgres by Q3",
        ));
    }

    /// A short summary fully contained in a stored one trips containment.
    #[test]
    fn contained_summary_is_rejected() {
        assert!(dup(
            "Alice owns the launch checklist",
            "Alice owns the launch checklist and will review it with marketing on Friday",
        ));
    }

    #[test]
    fn empty_log_never_rejects() {
        assert!(!is_duplicate("anything at all", &[], 0.5, 0.7));
    }

    #[test]
    fn exact_thresholds_count_as_duplicates() {
        // {aaaa bbbb cccc dddd} vs {aaaa bbbb cccc eeee}: jaccard = 3/5.
        let a = tokenize("aaaa bbbb cccc dddd");
        let b = tokenize("aaaa bbbb cccc eeee");
        assert!((jaccard(&a, &b) - 0.6).abs() < 1e-9);
        assert!(is_duplicate(
            "aaaa bbbb cccc dddd",
            &["aaaa bbbb cccc eeee".to_string()],
            0.6,
            1.1,
        ));
    }
}
