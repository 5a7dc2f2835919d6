//! Two-stage vote parsing for swarm responses.
//!
//! Stage one reads explicit `VOTE:` / `CONFIDENCE:` / `REASONING:` tags.
//! When no vote tag is present, stage two classifies the free text by
//! keyword, defaulting to `disagree` when nothing signals a stance.

use conclave_session::VoteKind;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Confidence assumed for a tagged vote without a `CONFIDENCE:` tag.
const TAGGED_DEFAULT_CONFIDENCE: f64 = 0.6;
/// Starting confidence for a classified (untagged) vote.
const HEURISTIC_BASE_CONFIDENCE: f64 = 0.5;
/// Confidence of a response that signals no stance at all.
const NO_SIGNAL_CONFIDENCE: f64 = 0.25;

const DISAGREE_PHRASES: &[&str] = &[
    "disagree",
    "do not agree",
    "don't agree",
    "object to",
    "reject",
    "oppose",
    "flawed",
    "incorrect",
    "not convinced",
];
const PIVOT_PHRASES: &[&str] = &[
    "pivot",
    "different approach",
    "instead",
    "alternative",
    "rethink",
    "reconsider",
    "change direction",
];
const EXTEND_PHRASES: &[&str] = &[
    "extend",
    "build on",
    "building on",
    "in addition",
    "additionally",
    "furthermore",
    "also suggest",
];
const AGREE_PHRASES: &[&str] = &[
    "agree",
    "concur",
    "support",
    "endorse",
    "approve",
    "sounds good",
    "makes sense",
];
const HEDGES: &[&str] = &["maybe", "perhaps", "might", "not sure", "unsure", "possibly"];
const BOOSTERS: &[&str] = &["strongly", "definitely", "clearly", "certainly", "absolutely"];

/// Which stage produced a [`ParsedVote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseSource {
    Tagged,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedVote {
    pub vote: VoteKind,
    pub confidence: f64,
    pub reasoning: String,
    pub source: ParseSource,
}

pub struct VoteParser {
    vote_tag: Regex,
    confidence_tag: Regex,
    reasoning_tag: Regex,
}

impl Default for VoteParser {
    fn default() -> Self {
        Self::new()
    }
}

impl VoteParser {
    // Literal patterns; compilation cannot fail.
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            vote_tag: Regex::new(r"(?i)\bvote\s*[:=][\s\*\[\(]*(agree|disagree|extend|pivot)\b")
                .expect("valid vote regex"),
            confidence_tag: Regex::new(r"(?i)\bconfidence\s*[:=]\s*\**\s*([0-9]*\.?[0-9]+)\s*(%)?")
                .expect("valid confidence regex"),
            reasoning_tag: Regex::new(r"(?is)\breasoning\s*[:=]\s*(.+)")
                .expect("valid reasoning regex"),
        }
    }

    pub fn parse(&self, text: &str) -> ParsedVote {
        self.parse_tagged(text)
            .unwrap_or_else(|| self.classify(text))
    }

    /// Stage one. `None` when there is no vote tag.
    pub fn parse_tagged(&self, text: &str) -> Option<ParsedVote> {
        let vote = self
            .vote_tag
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| VoteKind::parse(m.as_str()))?;
        let confidence = self
            .confidence_tag
            .captures(text)
            .and_then(|c| {
                let value: f64 = c.get(1)?.as_str().parse().ok()?;
                // Bare numbers from 2 up are percentages; (1, 2) clamps to 1.
                let is_percent = c.get(2).is_some() || value >= 2.0;
                Some(if is_percent { value / 100.0 } else { value })
            })
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(TAGGED_DEFAULT_CONFIDENCE);
        let reasoning = self
            .reasoning_tag
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| strip_tag_lines(text));
        Some(ParsedVote {
            vote,
            confidence,
            reasoning,
            source: ParseSource::Tagged,
        })
    }

    /// Stage two: keyword classification of free text.
    pub fn classify(&self, text: &str) -> ParsedVote {
        let lower = text.to_lowercase();
        let disagree = count_phrases(&lower, DISAGREE_PHRASES);
        let pivot = count_phrases(&lower, PIVOT_PHRASES);
        let extend = count_phrases(&lower, EXTEND_PHRASES);
        // "disagree" and "don't agree" also contain "agree".
        let negated_agree = lower.matches("disagree").count()
            + lower.matches("do not agree").count()
            + lower.matches("don't agree").count();
        let agree = count_phrases(&lower, AGREE_PHRASES).saturating_sub(negated_agree);

        // Ties resolve toward the more conservative stance.
        let ranked = [
            (VoteKind::Disagree, disagree),
            (VoteKind::Pivot, pivot),
            (VoteKind::Extend, extend),
            (VoteKind::Agree, agree),
        ];
        let mut best = ranked[0];
        for candidate in ranked.iter().skip(1) {
            if candidate.1 > best.1 {
                best = *candidate;
            }
        }

        let (vote, confidence) = if best.1 == 0 {
            (VoteKind::Disagree, NO_SIGNAL_CONFIDENCE)
        } else {
            let hedges = count_phrases(&lower, HEDGES) as f64;
            let boosters = count_phrases(&lower, BOOSTERS) as f64;
            let confidence = (HEURISTIC_BASE_CONFIDENCE + 0.1 * boosters - 0.1 * hedges)
                .clamp(0.2, 0.9);
            (best.0, confidence)
        };

        ParsedVote {
            vote,
            confidence,
            reasoning: text.trim().to_string(),
            source: ParseSource::Heuristic,
        }
    }
}

fn count_phrases(text: &str, phrases: &[&str]) -> usize {
    phrases.iter().map(|p| text.matches(p).count()).sum()
}

fn strip_tag_lines(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let l = line.trim_start().to_ascii_lowercase();
            !(l.starts_with("vote") || l.starts_with("confidence"))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_vote() {
        let parser = VoteParser::new();
        let vote = parser.parse("VOTE: agree\nCONFIDENCE: 0.85\nREASONING: The plan is sound.");
        assert_eq!(vote.vote, VoteKind::Agree);
        assert_eq!(vote.confidence, 0.85);
        assert_eq!(vote.reasoning, "The plan is sound.");
        assert_eq!(vote.source, ParseSource::Tagged);
    }

    #[test]
    fn test_tagged_variants() {
        let parser = VoteParser::new();
        let vote = parser.parse("**Vote:** [PIVOT] because latency matters. Confidence: 70%");
        assert_eq!(vote.vote, VoteKind::Pivot);
        assert!((vote.confidence - 0.7).abs() < 1e-9);

        let vote = parser.parse("vote = extend");
        assert_eq!(vote.vote, VoteKind::Extend);
        assert_eq!(vote.confidence, TAGGED_DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_tagged_disagree_not_read_as_agree() {
        let parser = VoteParser::new();
        let vote = parser.parse("VOTE: DISAGREE\nCONFIDENCE: 0.9");
        assert_eq!(vote.vote, VoteKind::Disagree);
    }

    #[test]
    fn test_confidence_clamped() {
        let parser = VoteParser::new();
        let vote = parser.parse("VOTE: agree CONFIDENCE: 250%");
        assert_eq!(vote.confidence, 1.0);
        let vote = parser.parse("VOTE: agree CONFIDENCE: 1.5");
        assert_eq!(vote.confidence, 1.0);
        let vote = parser.parse("VOTE: agree CONFIDENCE: 85");
        assert!((vote.confidence - 0.85).abs() < 1e-9);
        let vote = parser.parse("VOTE: agree CONFIDENCE: 1.5%");
        assert!((vote.confidence - 0.015).abs() < 1e-9);
    }

    #[test]
    fn test_heuristic_classification() {
        let parser = VoteParser::new();
        let vote = parser.parse("I strongly agree with this direction.");
        assert_eq!(vote.vote, VoteKind::Agree);
        assert_eq!(vote.source, ParseSource::Heuristic);
        assert!((vote.confidence - 0.6).abs() < 1e-9);

        let vote = parser.parse("I disagree; the approach is flawed.");
        assert_eq!(vote.vote, VoteKind::Disagree);

        let vote = parser.parse("Maybe we should reconsider and take a different approach.");
        assert_eq!(vote.vote, VoteKind::Pivot);
        assert!(vote.confidence < HEURISTIC_BASE_CONFIDENCE);

        let vote = parser.parse("Building on that, we could additionally cache results.");
        assert_eq!(vote.vote, VoteKind::Extend);
    }

    #[test]
    fn test_no_signal_defaults_conservative() {
        let parser = VoteParser::new();
        let vote = parser.parse("The weather is nice today.");
        assert_eq!(vote.vote, VoteKind::Disagree);
        assert_eq!(vote.confidence, NO_SIGNAL_CONFIDENCE);
    }
}
