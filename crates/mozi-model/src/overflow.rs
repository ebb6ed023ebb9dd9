// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Overflow classification of provider error messages (spec §4.B).
//!
//! Pure pattern matching over error text, same idiom as the teacher's
//! `extract_n_ctx_from_error` in `sven-core/src/agent.rs`: no provider SDKs
//! consulted, just case-insensitive substring/regex matching against known
//! error phrasings.

use regex::Regex;
use std::sync::OnceLock;

/// Strict overflow patterns: any one of these matching is conclusive.
fn strict_patterns() -> &'static [&'static str] {
    &[
        "request_too_large",
        "request exceeds the maximum size",
        "context length exceeded",
        "maximum context length",
        "prompt is too long",
        "exceeds model context window",
        "context overflow",
    ]
}

fn composite_matches(lower: &str) -> bool {
    lower.contains("request size exceeds")
        && (lower.contains("context window") || lower.contains("context length"))
}

fn status_413_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"413.*too large").expect("valid regex"))
}

fn likely_overflow_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"context window.*(too large|exceed|limit|max|requested|tokens)")
            .expect("valid regex")
    })
}

fn compaction_failure_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"summarization failed|compaction failed|auto-compaction|compaction")
            .expect("valid regex")
    })
}

/// Strict classification: is this error message a context-overflow error?
pub fn is_overflow(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    strict_patterns().iter().any(|p| lower.contains(p))
        || composite_matches(&lower)
        || status_413_regex().is_match(&lower)
}

/// Broader heuristic: catches phrasings the strict patterns miss, at the
/// cost of a few more false positives. Excludes the "window too small"
/// family, which is the opposite condition.
pub fn is_likely_overflow(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    if lower.contains("context window too small") || lower.contains("minimum is") {
        return false;
    }
    is_overflow(&lower) || likely_overflow_regex().is_match(&lower)
}

/// Whether an overflow error specifically indicates the auto-compaction
/// attempt itself failed (distinct from an overflow nothing tried to fix).
pub fn is_compaction_failure(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    is_overflow(&lower) && compaction_failure_regex().is_match(&lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_request_too_large() {
        assert!(is_overflow("Error: request_too_large (tokens)"));
    }

    #[test]
    fn detects_context_length_exceeded_case_insensitive() {
        assert!(is_overflow("CONTEXT LENGTH EXCEEDED for this model"));
    }

    #[test]
    fn detects_composite_pattern() {
        assert!(is_overflow("the request size exceeds the model's context window"));
    }

    #[test]
    fn detects_413_too_large() {
        assert!(is_overflow("413: payload too large"));
    }

    #[test]
    fn plain_error_is_not_overflow() {
        assert!(!is_overflow("connection refused"));
    }

    #[test]
    fn likely_overflow_catches_broader_phrasing() {
        assert!(is_likely_overflow("context window exceeded for requested tokens"));
    }

    #[test]
    fn likely_overflow_excludes_too_small() {
        assert!(!is_likely_overflow("context window too small, minimum is 1024 tokens"));
    }

    #[test]
    fn compaction_failure_requires_overflow_and_compaction_keyword() {
        assert!(is_compaction_failure(
            "context length exceeded: auto-compaction failed to reduce size"
        ));
        assert!(!is_compaction_failure("auto-compaction completed"));
    }
}
