//! Uncertainty assessment and the final judgment
//!
//! The judge is deterministic: it derives an uncertainty proxy from the
//! members' diagnostics and positions, raises collapse signals at fixed
//! thresholds, and maps those to a verdict.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::types::TeamMemberResult;

const INTRA_THRESHOLD: f64 = 0.55;
const INTER_THRESHOLD: f64 = 0.55;
const SYS_THRESHOLD: f64 = 0.6;
const FAILURE_RATE_THRESHOLD: f64 = 0.3;
const NO_EVIDENCE_RATE_THRESHOLD: f64 = 0.5;
const UNTRUSTED_FAILURE_RATE: f64 = 0.5;
const TRUSTED_SYS_CEILING: f64 = 0.4;
const CONTRADICTION_PENALTY: f64 = 0.1;
const FAILURE_RATE_WEIGHT: f64 = 0.5;

/// Named diagnostics indicating loss of confidence in team output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollapseSignal {
    HighIntraUncertainty,
    HighInterDisagreement,
    HighSystemUncertainty,
    TeammateFailures,
    InsufficientEvidence,
}

/// Aggregated uncertainty measures, each in [0, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyProxy {
    /// Within-member uncertainty: low confidence, self-contradiction
    pub u_intra: f64,
    /// Between-member disagreement on claims and next steps
    pub u_inter: f64,
    /// System-level uncertainty folding in the failure rate
    pub u_sys: f64,
    pub collapse_signals: Vec<CollapseSignal>,
}

/// Trust verdict over the whole team run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Trusted,
    Partial,
    Untrusted,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trusted => write!(f, "trusted"),
            Self::Partial => write!(f, "partial"),
            Self::Untrusted => write!(f, "untrusted"),
        }
    }
}

/// The judge's decision and its justification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalJudgment {
    pub verdict: Verdict,
    pub confidence: f64,
    pub reason: String,
    pub next_step: String,
    pub u_intra: f64,
    pub u_inter: f64,
    pub u_sys: f64,
}

/// Jaccard distance between two members' position tokens
fn divergence(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    1.0 - intersection / union
}

/// Compute the proxy and judgment over a finished member set
pub fn assess(members: &[TeamMemberResult]) -> (UncertaintyProxy, FinalJudgment) {
    let total = members.len().max(1) as f64;
    let completed: Vec<&TeamMemberResult> = members.iter().filter(|m| m.completed()).collect();

    let u_intra = if completed.is_empty() {
        1.0
    } else {
        let sum: f64 = completed
            .iter()
            .map(|m| {
                ((1.0 - m.diagnostics.confidence)
                    + CONTRADICTION_PENALTY * m.diagnostics.contradiction_signals as f64)
                    .clamp(0.0, 1.0)
            })
            .sum();
        (sum / completed.len() as f64).clamp(0.0, 1.0)
    };

    let positions: Vec<HashSet<String>> = completed
        .iter()
        .filter_map(|m| m.normalized.as_ref())
        .map(|n| n.position_tokens())
        .collect();
    let u_inter = if positions.len() < 2 {
        0.0
    } else {
        let mut sum = 0.0;
        let mut pairs = 0u32;
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                sum += divergence(&positions[i], &positions[j]);
                pairs += 1;
            }
        }
        (sum / pairs as f64).clamp(0.0, 1.0)
    };

    let failure_rate = (members.len() - completed.len()) as f64 / total;
    let no_evidence_rate = if completed.is_empty() {
        1.0
    } else {
        completed.iter().filter(|m| m.diagnostics.evidence_count == 0).count() as f64 / completed.len() as f64
    };

    let u_sys = (u_intra.max(u_inter) + FAILURE_RATE_WEIGHT * failure_rate).clamp(0.0, 1.0);

    let mut collapse_signals = Vec::new();
    if u_intra >= INTRA_THRESHOLD {
        collapse_signals.push(CollapseSignal::HighIntraUncertainty);
    }
    if u_inter >= INTER_THRESHOLD {
        collapse_signals.push(CollapseSignal::HighInterDisagreement);
    }
    if u_sys >= SYS_THRESHOLD {
        collapse_signals.push(CollapseSignal::HighSystemUncertainty);
    }
    if failure_rate >= FAILURE_RATE_THRESHOLD {
        collapse_signals.push(CollapseSignal::TeammateFailures);
    }
    if no_evidence_rate >= NO_EVIDENCE_RATE_THRESHOLD {
        collapse_signals.push(CollapseSignal::InsufficientEvidence);
    }

    let verdict = if u_sys >= SYS_THRESHOLD || failure_rate >= UNTRUSTED_FAILURE_RATE {
        Verdict::Untrusted
    } else if collapse_signals.is_empty() && u_sys < TRUSTED_SYS_CEILING {
        Verdict::Trusted
    } else {
        Verdict::Partial
    };

    let reason = if collapse_signals.is_empty() {
        format!("no collapse signals, u_sys {:.2}", u_sys)
    } else {
        let names: Vec<String> = collapse_signals
            .iter()
            .map(|s| serde_json::to_string(s).unwrap_or_default().trim_matches('"').to_string())
            .collect();
        format!("signals: {} (u_sys {:.2})", names.join(", "), u_sys)
    };

    // Lean on the most confident completed member for direction
    let next_step = completed
        .iter()
        .max_by(|a, b| a.diagnostics.confidence.total_cmp(&b.diagnostics.confidence))
        .and_then(|m| m.normalized.as_ref())
        .map(|n| n.next_step.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "rerun the task with a reduced scope".to_string());

    let proxy = UncertaintyProxy {
        u_intra,
        u_inter,
        u_sys,
        collapse_signals,
    };
    let judgment = FinalJudgment {
        verdict,
        confidence: (1.0 - u_sys).clamp(0.0, 1.0),
        reason,
        next_step,
        u_intra,
        u_inter,
        u_sys,
    };
    (proxy, judgment)
}
