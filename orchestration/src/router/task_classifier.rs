//! Task classification
//!
//! Maps an inbound message plus an optional context tag to a
//! [`TaskCategory`]. Classification is total: every input yields exactly one
//! category and nothing here can fail.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Category a request is routed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskCategory {
    General,
    /// Pricing, quotes, plans and licensing questions
    Sales,
    /// Troubleshooting and product support
    Technical,
    /// Code, scripts, queries and integrations
    Code,
    /// Maintenance scheduling, forecasting and failure prediction
    MaintenancePrediction,
}

impl TaskCategory {
    pub fn all() -> &'static [TaskCategory] {
        &[
            Self::General,
            Self::Sales,
            Self::Technical,
            Self::Code,
            Self::MaintenancePrediction,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Sales => "sales",
            Self::Technical => "technical",
            Self::Code => "code",
            Self::MaintenancePrediction => "maintenance-prediction",
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for TaskCategory {
    type Err = UnknownCategory;

    /// Accepts `maintenance-prediction`, `maintenance_prediction` and
    /// `Maintenance Prediction` alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['_', ' '], "-");
        Self::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// How a category was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationSource {
    /// The caller's context hint named a category.
    Hint,
    /// A keyword rule matched; carries the matched text.
    Keyword(String),
    /// Nothing matched.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: TaskCategory,
    pub source: ClassificationSource,
}

/// Keyword rules in evaluation order. First match wins.
const RULES: &[(TaskCategory, &[&str])] = &[
    (
        TaskCategory::Sales,
        &[
            "price", "prices", "pricing", "quote", "quotes", "cost", "costs", "cheaper",
            "how much", "subscription", "license", "licence", "discount", "trial", "demo",
            "billing", "invoice",
        ],
    ),
    (
        TaskCategory::Technical,
        &[
            "error", "errors", "debug", "debugging", "troubleshoot", "troubleshooting", "bug",
            "bugs", "crash", "crashes", "crashed", "not working", "fail", "fails", "failed",
            "failing", "exception", "stack trace", "broken",
        ],
    ),
    (
        TaskCategory::MaintenancePrediction,
        &[
            "schedule", "scheduling", "maintenance", "predict", "prediction", "predictive",
            "forecast", "preventive", "downtime", "failure rate", "mtbf", "mttr", "wear",
            "remaining useful life",
        ],
    ),
    (
        TaskCategory::Code,
        &[
            "code", "function", "api", "script", "sql", "json", "regex", "compile", "snippet",
            "endpoint", "webhook",
        ],
    ),
];

static RULE_PATTERNS: LazyLock<Vec<(TaskCategory, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|(category, words)| {
            let alternation = words
                .iter()
                .map(|w| regex::escape(w))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\b(?:{alternation})\b");
            let re = Regex::new(&pattern).expect("classifier rule regex should compile");
            (*category, re)
        })
        .collect()
});

/// Deterministic keyword classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskClassifier;

impl TaskClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Pick the category for a message.
    pub fn classify(&self, message: &str, context_hint: Option<&str>) -> TaskCategory {
        self.classify_detailed(message, context_hint).category
    }

    /// Like [`classify`](Self::classify) but reports why.
    pub fn classify_detailed(&self, message: &str, context_hint: Option<&str>) -> Classification {
        if let Some(category) = context_hint.and_then(|h| h.parse::<TaskCategory>().ok()) {
            return Classification {
                category,
                source: ClassificationSource::Hint,
            };
        }

        for (category, pattern) in RULE_PATTERNS.iter() {
            if let Some(m) = pattern.find(message) {
                return Classification {
                    category: *category,
                    source: ClassificationSource::Keyword(m.as_str().to_lowercase()),
                };
            }
        }

        Classification {
            category: TaskCategory::General,
            source: ClassificationSource::Default,
        }
    }
}
