//! Session state for one running workflow instance.
//!
//! Sessions are persisted as camelCase JSON so operators can read a stuck
//! workflow's position directly from `.stepwise/sessions/<id>.json`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Paths submitted for one output: a single path or a list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OutputValue {
    Single(String),
    List(Vec<String>),
}

impl OutputValue {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            OutputValue::Single(path) => vec![path.as_str()],
            OutputValue::List(paths) => paths.iter().map(String::as_str).collect(),
        }
    }
}

/// Output name -> submitted paths.
pub type StepOutputs = BTreeMap<String, OutputValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub job_name: String,
    pub workflow_name: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub current_entry_index: usize,
    #[serde(default)]
    pub completed_step_ids: Vec<String>,
    /// Step id -> output name -> paths.
    #[serde(default)]
    pub collected_outputs: BTreeMap<String, StepOutputs>,
    /// Needs-work verdicts returned so far, per step of the current entry.
    #[serde(default)]
    pub quality_attempts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_feedback: Option<String>,
    /// Set once the quality gate is exhausted; only an abort clears the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<BlockedStep>,
    /// Reasons given for bypassing an incomplete review, per step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub review_overrides: BTreeMap<String, String>,
    /// Steps whose quality review is running, with the time the claim lapses.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reviews_in_flight: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Push order on the session stack (higher is closer to the top).
    pub stack_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockedStep {
    pub step_id: String,
    pub attempts: u32,
    pub last_feedback: String,
}

impl Session {
    pub fn new(job_name: &str, workflow_name: &str, goal: &str, instance_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            job_name: job_name.to_string(),
            workflow_name: workflow_name.to_string(),
            goal: goal.to_string(),
            instance_id,
            current_entry_index: 0,
            completed_step_ids: Vec::new(),
            collected_outputs: BTreeMap::new(),
            quality_attempts: BTreeMap::new(),
            last_feedback: None,
            blocked: None,
            review_overrides: BTreeMap::new(),
            reviews_in_flight: BTreeMap::new(),
            parent_session_id: None,
            stack_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_step_ids.iter().any(|id| id == step_id)
    }

    pub fn attempts_for(&self, step_id: &str) -> u32 {
        self.quality_attempts.get(step_id).copied().unwrap_or(0)
    }

    /// A review claim that has not lapsed by `now`, as `(step_id, expires_at)`.
    pub fn review_in_flight(&self, now: DateTime<Utc>) -> Option<(&str, DateTime<Utc>)> {
        self.reviews_in_flight
            .iter()
            .find(|(_, expires_at)| **expires_at > now)
            .map(|(step_id, expires_at)| (step_id.as_str(), *expires_at))
    }

    /// Branch name for work done under this session.
    ///
    /// Uses the instance id when present, otherwise the creation date.
    pub fn branch_name(&self) -> String {
        let suffix = match &self.instance_id {
            Some(instance) => instance.clone(),
            None => self.created_at.format("%Y%m%d").to_string(),
        };
        format!("stepwise/{}-{}-{}", self.job_name, self.workflow_name, suffix)
    }

    /// Record an accepted step: merge outputs, mark completed, reset its counter.
    pub fn record_completed(&mut self, step_id: &str, outputs: StepOutputs) {
        self.collected_outputs
            .entry(step_id.to_string())
            .or_default()
            .extend(outputs);
        if !self.is_completed(step_id) {
            self.completed_step_ids.push(step_id.to_string());
        }
        self.quality_attempts.remove(step_id);
        self.reviews_in_flight.remove(step_id);
        self.last_feedback = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case_fields() {
        let mut session = Session::new("job", "flow", "goal", Some("acme".to_string()));
        session.session_id = "abc".to_string();
        let value = serde_json::to_value(&session).expect("serialize");
        for key in [
            "sessionId",
            "jobName",
            "workflowName",
            "goal",
            "instanceId",
            "currentEntryIndex",
            "completedStepIds",
            "collectedOutputs",
            "qualityAttempts",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert!(value.get("blocked").is_none());
    }

    #[test]
    fn branch_name_prefers_instance_id() {
        let session = Session::new("research", "full", "goal", Some("acme".to_string()));
        assert_eq!(session.branch_name(), "stepwise/research-full-acme");

        let dated = Session::new("research", "full", "goal", None);
        assert!(dated.branch_name().starts_with("stepwise/research-full-20"));
    }

    #[test]
    fn record_completed_resets_attempts() {
        let mut session = Session::new("job", "flow", "goal", None);
        session.quality_attempts.insert("a".to_string(), 2);
        session.last_feedback = Some("fix it".to_string());

        let mut outputs = StepOutputs::new();
        outputs.insert("report".to_string(), OutputValue::Single("r.md".to_string()));
        session.record_completed("a", outputs);

        assert!(session.is_completed("a"));
        assert_eq!(session.attempts_for("a"), 0);
        assert_eq!(session.last_feedback, None);
        assert_eq!(
            session.collected_outputs["a"]["report"],
            OutputValue::Single("r.md".to_string())
        );
    }

    #[test]
    fn lapsed_review_claims_are_ignored() {
        let mut session = Session::new("job", "flow", "goal", None);
        let now = Utc::now();
        session
            .reviews_in_flight
            .insert("a".to_string(), now - chrono::TimeDelta::seconds(1));
        assert_eq!(session.review_in_flight(now), None);

        let expires_at = now + chrono::TimeDelta::minutes(5);
        session.reviews_in_flight.insert("b".to_string(), expires_at);
        assert_eq!(session.review_in_flight(now), Some(("b", expires_at)));
        assert!(
            serde_json::to_value(&session).expect("serialize")["reviewsInFlight"]["b"].is_string()
        );
    }

    #[test]
    fn output_value_accepts_string_or_list() {
        let single: OutputValue = serde_json::from_str("\"a.md\"").expect("single");
        let list: OutputValue = serde_json::from_str("[\"a.md\",\"b.md\"]").expect("list");
        assert_eq!(single.paths(), vec!["a.md"]);
        assert_eq!(list.paths(), vec!["a.md", "b.md"]);
    }
}
