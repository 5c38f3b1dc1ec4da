//! Human approval queue for gated plans and tool calls.
//!
//! Ported from `sentinel/core/approval.py`: approvals are created pending,
//! expire on a fixed TTL, and accept at most one decision — the first
//! `submit_approval` call wins, every later one is rejected as a duplicate.
//! Expiry is swept lazily on every entry point rather than by a background
//! task, exactly as the original's `_cleanup_expired` is called at the top
//! of `request_plan_approval` and `check_approval`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::model::Plan;

/// Current state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Granted.
    Approved,
    /// Rejected.
    Denied,
    /// TTL elapsed before a decision was made.
    Expired,
}

/// A full approval request: the plan awaiting sign-off plus its outcome,
/// once decided.
#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    /// Unique id, handed back to the caller that requested approval.
    pub approval_id: String,
    /// The plan awaiting approval.
    pub plan: Plan,
    /// Opaque caller-provided origin, for audit correlation.
    pub source_key: String,
    /// The original user request text, for audit correlation.
    pub user_request: String,
    /// Current status.
    pub status: ApprovalStatus,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record stops accepting a decision.
    pub expires_at: DateTime<Utc>,
    /// Reason given with the decision, if any.
    pub decided_reason: String,
    /// Identity of the decider, if any.
    pub decided_by: String,
}

/// The result of looking up an approval's status, mirroring the original's
/// `check_approval` response shape without the `not_found` sentinel variant
/// — that case is instead a plain `None` from [`ApprovalManager::check`].
#[derive(Debug, Clone)]
pub struct ApprovalCheck {
    /// Current status.
    pub status: ApprovalStatus,
    /// Reason given with the decision, if any.
    pub reason: String,
    /// Identity of the decider, if any.
    pub decided_by: String,
}

/// Queue of pending human approvals.
#[async_trait]
pub trait ApprovalManager: Send + Sync {
    /// Create a pending approval request for `plan`. Returns the new
    /// request's id.
    async fn request_plan_approval(&self, plan: Plan, source_key: String, user_request: String) -> String;

    /// Look up an approval's current status, sweeping expiry first.
    /// Returns `None` if no such id was ever created.
    async fn check_approval(&self, approval_id: &str) -> Option<ApprovalCheck>;

    /// Submit a decision. Returns `true` if the decision was accepted —
    /// `false` if the id is unknown, already decided, or expired.
    async fn submit_approval(&self, approval_id: &str, granted: bool, reason: String, approved_by: String) -> bool;

    /// Fetch the plan associated with an approval id, regardless of status.
    async fn get_plan(&self, approval_id: &str) -> Option<Plan>;

    /// `Some(true)` if approved, `Some(false)` if denied, `None` if still
    /// pending, expired, or unknown.
    async fn is_approved(&self, approval_id: &str) -> Option<bool>;
}

struct ApprovalState {
    records: HashMap<String, ApprovalRecord>,
}

/// Default in-memory [`ApprovalManager`], TTL-bounded and process-local.
pub struct InMemoryApprovalManager {
    state: Mutex<ApprovalState>,
    default_timeout: ChronoDuration,
}

impl InMemoryApprovalManager {
    /// Construct a manager with the given default approval TTL, in seconds.
    #[must_use]
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            state: Mutex::new(ApprovalState {
                records: HashMap::new(),
            }),
            default_timeout: ChronoDuration::seconds(timeout_secs as i64),
        }
    }

    /// Mark every pending record past its `expires_at` as expired. Called at
    /// the top of every entry point, matching the original's
    /// `_cleanup_expired` placement.
    fn sweep_expired(state: &mut ApprovalState) {
        let now = Utc::now();
        for record in state.records.values_mut() {
            if record.status == ApprovalStatus::Pending && record.expires_at < now {
                record.status = ApprovalStatus::Expired;
            }
        }
    }
}

#[async_trait]
impl ApprovalManager for InMemoryApprovalManager {
    async fn request_plan_approval(&self, plan: Plan, source_key: String, user_request: String) -> String {
        let mut state = self.state.lock().expect("approval state mutex poisoned");
        Self::sweep_expired(&mut state);

        let approval_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        state.records.insert(
            approval_id.clone(),
            ApprovalRecord {
                approval_id: approval_id.clone(),
                plan,
                source_key,
                user_request,
                status: ApprovalStatus::Pending,
                created_at: now,
                expires_at: now + self.default_timeout,
                decided_reason: String::new(),
                decided_by: String::new(),
            },
        );
        approval_id
    }

    async fn check_approval(&self, approval_id: &str) -> Option<ApprovalCheck> {
        let mut state = self.state.lock().expect("approval state mutex poisoned");
        Self::sweep_expired(&mut state);

        state.records.get(approval_id).map(|record| ApprovalCheck {
            status: record.status,
            reason: record.decided_reason.clone(),
            decided_by: record.decided_by.clone(),
        })
    }

    async fn submit_approval(&self, approval_id: &str, granted: bool, reason: String, approved_by: String) -> bool {
        let mut state = self.state.lock().expect("approval state mutex poisoned");

        let Some(record) = state.records.get_mut(approval_id) else {
            return false;
        };

        if record.status == ApprovalStatus::Pending && record.expires_at < Utc::now() {
            record.status = ApprovalStatus::Expired;
        }

        if record.status != ApprovalStatus::Pending {
            return false;
        }

        record.status = if granted { ApprovalStatus::Approved } else { ApprovalStatus::Denied };
        record.decided_reason = reason;
        record.decided_by = approved_by;
        true
    }

    async fn get_plan(&self, approval_id: &str) -> Option<Plan> {
        let state = self.state.lock().expect("approval state mutex poisoned");
        state.records.get(approval_id).map(|r| r.plan.clone())
    }

    async fn is_approved(&self, approval_id: &str) -> Option<bool> {
        let mut state = self.state.lock().expect("approval state mutex poisoned");
        Self::sweep_expired(&mut state);

        match state.records.get(approval_id)?.status {
            ApprovalStatus::Approved => Some(true),
            ApprovalStatus::Denied => Some(false),
            ApprovalStatus::Pending | ApprovalStatus::Expired => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApprovalMode;

    fn empty_plan() -> Plan {
        Plan {
            summary: "test plan".to_string(),
            steps: Vec::new(),
            approval_mode: ApprovalMode::BeforePlan,
        }
    }

    #[tokio::test]
    async fn request_then_approve_round_trips() {
        let manager = InMemoryApprovalManager::new(300);
        let id = manager
            .request_plan_approval(empty_plan(), "src".to_string(), "do the thing".to_string())
            .await;

        let check = manager.check_approval(&id).await.unwrap();
        assert_eq!(check.status, ApprovalStatus::Pending);

        let accepted = manager.submit_approval(&id, true, "looks fine".to_string(), "reviewer".to_string()).await;
        assert!(accepted);
        assert_eq!(manager.is_approved(&id).await, Some(true));
    }

    #[tokio::test]
    async fn second_submission_is_rejected() {
        let manager = InMemoryApprovalManager::new(300);
        let id = manager.request_plan_approval(empty_plan(), String::new(), String::new()).await;

        assert!(manager.submit_approval(&id, true, String::new(), "first".to_string()).await);
        assert!(!manager.submit_approval(&id, false, String::new(), "second".to_string()).await);

        let check = manager.check_approval(&id).await.unwrap();
        assert_eq!(check.status, ApprovalStatus::Approved);
        assert_eq!(check.decided_by, "first");
    }

    #[tokio::test]
    async fn unknown_id_returns_none_or_false() {
        let manager = InMemoryApprovalManager::new(300);
        assert!(manager.check_approval("nope").await.is_none());
        assert!(!manager.submit_approval("nope", true, String::new(), String::new()).await);
        assert!(manager.is_approved("nope").await.is_none());
    }

    #[tokio::test]
    async fn expired_approval_cannot_be_submitted() {
        let manager = InMemoryApprovalManager::new(0);
        let id = manager.request_plan_approval(empty_plan(), String::new(), String::new()).await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(!manager.submit_approval(&id, true, String::new(), String::new()).await);
        let check = manager.check_approval(&id).await.unwrap();
        assert_eq!(check.status, ApprovalStatus::Expired);
    }
}
