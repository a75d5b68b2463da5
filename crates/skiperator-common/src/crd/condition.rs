//! Run-state conditions reported on a parent's status

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Truth value of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// Not yet observed
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Wire form, as written to the status subresource
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(active: bool) -> Self {
        if active {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One condition, e.g. `Running` or `Failed` for a SKIPJob run
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition holds
    pub status: ConditionStatus,
    /// CamelCase reason, e.g. `JobFailed`
    pub reason: String,
    /// Explanation for humans
    #[serde(default)]
    pub message: String,
    /// When `status` last changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// A condition that transitions now
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Whether the condition is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}
