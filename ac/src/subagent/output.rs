//! Labeled-section output parsing
//!
//! Sub-agents are instructed to answer in labeled sections:
//!
//! ```text
//! SUMMARY: one line
//! CLAIM: the central claim
//! EVIDENCE:
//! - first source
//! - second source
//! RESULT:
//! free-form, possibly multi-line
//! NEXT_STEP: what should happen next
//! CONFIDENCE: 0.8
//! ```
//!
//! Missing sections degrade gracefully: the raw text is preserved under
//! RESULT, `degraded` is set, and confidence drops to 0.4 so the judge can
//! weight it down.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(SUMMARY|CLAIM|EVIDENCE|RESULT|NEXT_STEP|CONFIDENCE):\s*(.*)$").unwrap());
static CONTRADICTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(however|contradicts?\w*|inconsistent\w*|conflicts? with)\b").unwrap());
static CONFLICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(disagree\w*|disputes?\w*|rejects?\w*)\b").unwrap());

const DEGRADED_CONFIDENCE: f64 = 0.4;
const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Signals the judge consumes per member
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemberDiagnostics {
    /// Self-reported or defaulted confidence in [0, 1]
    pub confidence: f64,
    pub evidence_count: usize,
    pub contradiction_signals: u32,
    pub conflict_signals: u32,
}

/// Parsed, normalized sub-agent output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedOutput {
    pub summary: String,
    pub claim: String,
    pub evidence: Vec<String>,
    pub result: String,
    pub next_step: String,
    /// True when required sections were missing and the raw text was
    /// preserved under RESULT instead
    pub degraded: bool,
    pub diagnostics: MemberDiagnostics,
}

impl NormalizedOutput {
    /// Parse raw model text; never fails, degrading instead
    pub fn parse(raw: &str) -> Self {
        let mut summary = None;
        let mut claim = None;
        let mut evidence_lines: Vec<String> = Vec::new();
        let mut result_lines: Vec<String> = Vec::new();
        let mut next_step = None;
        let mut confidence: Option<f64> = None;

        let mut current: Option<&str> = None;
        let mut saw_evidence = false;
        let mut saw_result = false;

        for line in raw.lines() {
            if let Some(caps) = LABEL_RE.captures(line.trim_end()) {
                let label = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let rest = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
                current = Some(label);
                match label {
                    "SUMMARY" => summary = Some(rest.to_string()),
                    "CLAIM" => claim = Some(rest.to_string()),
                    "EVIDENCE" => {
                        saw_evidence = true;
                        if !rest.is_empty() {
                            evidence_lines.push(rest.to_string());
                        }
                    }
                    "RESULT" => {
                        saw_result = true;
                        if !rest.is_empty() {
                            result_lines.push(rest.to_string());
                        }
                    }
                    "NEXT_STEP" => next_step = Some(rest.to_string()),
                    "CONFIDENCE" => confidence = rest.parse().ok(),
                    _ => {}
                }
                continue;
            }

            match current {
                Some("EVIDENCE") => {
                    let item = line.trim().trim_start_matches("- ").trim();
                    if !item.is_empty() {
                        evidence_lines.push(item.to_string());
                    }
                }
                Some("RESULT") => result_lines.push(line.to_string()),
                Some("SUMMARY") if !line.trim().is_empty() => {
                    if let Some(s) = summary.as_mut() {
                        s.push(' ');
                        s.push_str(line.trim());
                    }
                }
                Some("CLAIM") if !line.trim().is_empty() => {
                    if let Some(c) = claim.as_mut() {
                        c.push(' ');
                        c.push_str(line.trim());
                    }
                }
                Some("NEXT_STEP") if !line.trim().is_empty() => {
                    if let Some(n) = next_step.as_mut() {
                        n.push(' ');
                        n.push_str(line.trim());
                    }
                }
                _ => {}
            }
        }

        let complete = summary.is_some() && claim.is_some() && saw_evidence && saw_result && next_step.is_some();

        if complete {
            let claim = claim.unwrap_or_default();
            let result = result_lines.join("\n").trim().to_string();
            let signal_text = format!("{claim}\n{result}");
            Self {
                summary: summary.unwrap_or_default(),
                claim,
                next_step: next_step.unwrap_or_default(),
                degraded: false,
                diagnostics: MemberDiagnostics {
                    confidence: confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
                    evidence_count: evidence_lines.len(),
                    contradiction_signals: CONTRADICTION_RE.find_iter(&signal_text).count() as u32,
                    conflict_signals: CONFLICT_RE.find_iter(&signal_text).count() as u32,
                },
                evidence: evidence_lines,
                result,
            }
        } else {
            Self::degraded(raw)
        }
    }

    /// Wrap unstructured text, preserving it under RESULT
    pub fn degraded(raw: &str) -> Self {
        let first_line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
        let summary: String = first_line.chars().take(120).collect();
        Self {
            summary,
            claim: String::new(),
            evidence: Vec::new(),
            result: raw.trim().to_string(),
            next_step: String::new(),
            degraded: true,
            diagnostics: MemberDiagnostics {
                confidence: DEGRADED_CONFIDENCE,
                evidence_count: 0,
                contradiction_signals: CONTRADICTION_RE.find_iter(raw).count() as u32,
                conflict_signals: CONFLICT_RE.find_iter(raw).count() as u32,
            },
        }
    }

    /// Canonical labeled rendering, used when showing peers this output
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("SUMMARY: {}\n", self.summary));
        out.push_str(&format!("CLAIM: {}\n", self.claim));
        out.push_str("EVIDENCE:\n");
        for item in &self.evidence {
            out.push_str(&format!("- {}\n", item));
        }
        out.push_str(&format!("RESULT:\n{}\n", self.result));
        out.push_str(&format!("NEXT_STEP: {}\n", self.next_step));
        out
    }

    /// Tokens of CLAIM and NEXT_STEP, the divergence basis between members
    pub fn position_tokens(&self) -> std::collections::HashSet<String> {
        format!("{} {}", self.claim, self.next_step)
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(|t| t.to_lowercase())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = "\
SUMMARY: checked the cache layer
CLAIM: the cache is correct
EVIDENCE:
- unit tests pass
- manual inspection of eviction path
RESULT:
All eviction paths covered.
Multi-line detail here.
NEXT_STEP: ship it
CONFIDENCE: 0.85
";

    #[test]
    fn test_parse_well_formed() {
        let output = NormalizedOutput::parse(WELL_FORMED);
        assert!(!output.degraded);
        assert_eq!(output.summary, "checked the cache layer");
        assert_eq!(output.claim, "the cache is correct");
        assert_eq!(output.evidence.len(), 2);
        assert_eq!(output.evidence[1], "manual inspection of eviction path");
        assert!(output.result.contains("Multi-line detail here."));
        assert_eq!(output.next_step, "ship it");
        assert_eq!(output.diagnostics.confidence, 0.85);
        assert_eq!(output.diagnostics.evidence_count, 2);
    }

    #[test]
    fn test_parse_missing_sections_degrades() {
        let output = NormalizedOutput::parse("The model just rambled here.\nNo labels at all.");
        assert!(output.degraded);
        assert_eq!(output.diagnostics.confidence, 0.4);
        assert!(output.result.contains("rambled"));
        assert_eq!(output.summary, "The model just rambled here.");
        assert_eq!(output.diagnostics.evidence_count, 0);
    }

    #[test]
    fn test_parse_partial_sections_degrades() {
        let output = NormalizedOutput::parse("SUMMARY: something\nCLAIM: partial\n");
        assert!(output.degraded);
        assert!(output.result.contains("SUMMARY: something"));
    }

    #[test]
    fn test_default_confidence_without_label() {
        let without_confidence = WELL_FORMED.replace("CONFIDENCE: 0.85\n", "");
        let output = NormalizedOutput::parse(&without_confidence);
        assert!(!output.degraded);
        assert_eq!(output.diagnostics.confidence, 0.7);
    }

    #[test]
    fn test_confidence_clamped() {
        let inflated = WELL_FORMED.replace("CONFIDENCE: 0.85", "CONFIDENCE: 7.5");
        let output = NormalizedOutput::parse(&inflated);
        assert_eq!(output.diagnostics.confidence, 1.0);
    }

    #[test]
    fn test_contradiction_signals_counted() {
        let text = WELL_FORMED.replace(
            "All eviction paths covered.",
            "However, this contradicts the earlier report and is inconsistent with it.",
        );
        let output = NormalizedOutput::parse(&text);
        assert!(output.diagnostics.contradiction_signals >= 3);
    }

    #[test]
    fn test_conflict_signals_counted() {
        let text = WELL_FORMED.replace("All eviction paths covered.", "I disagree with the reviewer and dispute it.");
        let output = NormalizedOutput::parse(&text);
        assert_eq!(output.diagnostics.conflict_signals, 2);
    }

    #[test]
    fn test_render_round_trip() {
        let output = NormalizedOutput::parse(WELL_FORMED);
        let reparsed = NormalizedOutput::parse(&output.render());
        assert!(!reparsed.degraded);
        assert_eq!(reparsed.claim, output.claim);
        assert_eq!(reparsed.evidence, output.evidence);
        assert_eq!(reparsed.next_step, output.next_step);
    }

    #[test]
    fn test_position_tokens() {
        let output = NormalizedOutput::parse(WELL_FORMED);
        let tokens = output.position_tokens();
        assert!(tokens.contains("cache"));
        assert!(tokens.contains("ship"));
        // Short words dropped
        assert!(!tokens.contains("it"));
    }
}
