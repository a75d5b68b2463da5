//! Status model shared by every parent resource
//!
//! Each reconcile step (a "controller" in status terms) owns one entry in
//! `subresources`. The `summary` is never written directly: it is folded from
//! the sub-statuses by [`aggregate`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::Condition;

/// Message used when sub-statuses disagree without any error or progress
pub const INCONSISTENT_STATE: &str = "inconsistent controller state";

/// Reconciliation status of a parent or one of its steps
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Status {
    /// Nothing has been reconciled yet
    #[default]
    Pending,
    /// Reconciliation is in flight or waiting on a requeue
    Progressing,
    /// Desired state has been written
    Synced,
    /// Reconciliation failed
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Synced => write!(f, "Synced"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// A status value with its explanation and the time it was set
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    /// Status value
    pub status: Status,
    /// Human-readable explanation
    #[serde(default)]
    pub message: String,
    /// When the value was last set
    pub time_stamp: DateTime<Utc>,
}

impl StatusEntry {
    /// Create an entry stamped with the current time
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            time_stamp: Utc::now(),
        }
    }

    fn same_as(&self, other: &StatusEntry) -> bool {
        self.status == other.status && self.message == other.message
    }
}

impl Default for StatusEntry {
    fn default() -> Self {
        Self::new(Status::Pending, "Default Status")
    }
}

/// Status subresource of Application, SKIPJob and Routing
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkiperatorStatus {
    /// Aggregate of all sub-statuses
    #[serde(default)]
    pub summary: StatusEntry,

    /// Status per reconcile step, keyed by step name
    #[serde(default)]
    pub subresources: BTreeMap<String, StatusEntry>,

    /// Conditions (used for SKIPJob run state)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// UID of the batch Job whose run state the conditions describe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_run: Option<String>,

    /// Parent generation the one-off Job of the current run was created for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_generation: Option<i64>,
}

impl SkiperatorStatus {
    /// Set the sub-status of one step and refresh the summary.
    ///
    /// The timestamp of an unchanged entry is kept so that re-setting the same
    /// value does not produce a status write.
    pub fn set(&mut self, controller: &str, status: Status, message: impl Into<String>) {
        let entry = StatusEntry::new(status, message);
        match self.subresources.get(controller) {
            Some(existing) if existing.same_as(&entry) => {}
            _ => {
                self.subresources.insert(controller.to_string(), entry);
            }
        }
        self.refresh_summary();
    }

    /// Recompute `summary` from `subresources`
    pub fn refresh_summary(&mut self) {
        let summary = aggregate(&self.subresources);
        if !self.summary.same_as(&summary) {
            self.summary = summary;
        }
    }

    /// Set (or replace) a condition by type, keeping its transition time when
    /// the status does not change.
    pub fn set_condition(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status != condition.status {
                    *existing = condition;
                } else {
                    existing.reason = condition.reason;
                    existing.message = condition.message;
                }
            }
            None => self.conditions.push(condition),
        }
    }

    /// Whether the condition of the given type is `True`
    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.is_true())
    }

    /// Equality ignoring timestamps, used to skip no-op status writes
    pub fn semantically_equal(&self, other: &SkiperatorStatus) -> bool {
        self.summary.same_as(&other.summary)
            && self.subresources.len() == other.subresources.len()
            && self
                .subresources
                .iter()
                .all(|(k, v)| other.subresources.get(k).is_some_and(|o| v.same_as(o)))
            && self.current_run == other.current_run
            && self.run_generation == other.run_generation
            && self.conditions.len() == other.conditions.len()
            && self.conditions.iter().zip(&other.conditions).all(|(a, b)| {
                a.type_ == b.type_
                    && a.status == b.status
                    && a.reason == b.reason
                    && a.message == b.message
            })
    }
}

/// Fold sub-statuses into a summary.
///
/// Precedence: any `Error` wins, then any `Progressing`; if all entries agree
/// the shared value is used; any other mix is reported as an error. An empty
/// map is `Pending`.
pub fn aggregate(subresources: &BTreeMap<String, StatusEntry>) -> StatusEntry {
    if subresources.is_empty() {
        return StatusEntry::new(Status::Pending, "no controllers have reported");
    }

    if let Some((name, entry)) = subresources
        .iter()
        .find(|(_, e)| e.status == Status::Error)
    {
        return StatusEntry::new(Status::Error, format!("{name}: {}", entry.message));
    }

    if subresources.values().any(|e| e.status == Status::Progressing) {
        return StatusEntry::new(Status::Progressing, "controllers are progressing");
    }

    let mut values = subresources.values().map(|e| e.status);
    let first = values.next().unwrap_or_default();
    if values.all(|s| s == first) {
        let message = match first {
            Status::Synced => "all controllers synced",
            Status::Pending => "all controllers pending",
            _ => "",
        };
        return StatusEntry::new(first, message);
    }

    StatusEntry::new(Status::Error, INCONSISTENT_STATE)
}
