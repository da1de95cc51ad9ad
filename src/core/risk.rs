use serde::Serialize;

/// Coarse risk tier for inbound comment text. `High` gates any autonomous
/// reply behind human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::High => "high",
        }
    }

    pub fn from_str(s: &str) -> RiskLevel {
        match s {
            "high" => RiskLevel::High,
            _ => RiskLevel::Low,
        }
    }
}

/// Terms that must never slip through unreviewed: fraud/fake/refund/complaint
/// vocabulary and the common hostile one-character insults in the product
/// locale. False positives are acceptable; a miss on any listed term is not.
const DENYLIST: &[&str] = &[
    "詐騙",
    "假的",
    "退款",
    "投訴",
    "死",
    "爛",
    "垃圾",
    "騙",
    "黑心",
];

/// Case-sensitive substring scan over the fixed denylist. Deterministic and
/// total: every input maps to exactly one tier.
pub fn classify(text: &str) -> RiskLevel {
    if DENYLIST.iter().any(|term| text.contains(term)) {
        RiskLevel::High
    } else {
        RiskLevel::Low
    }
}
