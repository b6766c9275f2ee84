use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Condition category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Category {
    #[default]
    Advisory,
    Critical,
    Required,
    Warn,
}

/// A durable or transient condition attached to a status object.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub r#type: String,
    pub status: ConditionStatus,
    pub category: Category,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub durable: bool,
    pub last_transition_time: Option<DateTime<Utc>>,
    // Set by the staging pass within one reconcile; never persisted.
    #[serde(skip)]
    pub staged: bool,
}

/// Condition list with staging semantics: non-durable conditions
/// not re-set during the current reconcile are dropped at end-staging.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(pub Vec<Condition>);

impl Conditions {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find(&self, r#type: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.r#type == r#type)
    }

    pub fn has_condition(&self, r#type: &str) -> bool {
        self.find(r#type)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    pub fn has_any_condition(&self, types: &[&str]) -> bool {
        types.iter().any(|t| self.has_condition(t))
    }

    /// Set (add or update) a condition. The transition time only moves
    /// when the status changes.
    pub fn set(&mut self, mut condition: Condition) {
        condition.staged = true;
        match self.0.iter_mut().find(|c| c.r#type == condition.r#type) {
            Some(existing) => {
                if existing.status != condition.status || existing.last_transition_time.is_none() {
                    condition.last_transition_time = Some(Utc::now());
                } else {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(Utc::now());
                self.0.push(condition);
            }
        }
    }

    pub fn delete(&mut self, types: &[&str]) {
        self.0.retain(|c| !types.contains(&c.r#type.as_str()));
    }

    /// Begin a staging pass: conditions set before this reconcile
    /// become candidates for removal.
    pub fn begin_staging(&mut self) {
        for c in &mut self.0 {
            c.staged = false;
        }
    }

    /// End the staging pass: drop non-durable conditions that were
    /// not re-set since `begin_staging`.
    pub fn end_staging(&mut self) {
        self.0.retain(|c| c.durable || c.staged);
    }
}
