//! Billing ledger integration.
//!
//! Tasks that cost credits place a hold (freeze) at submission; the hold is
//! settled on success and rolled back when the task fails, is cancelled, or
//! is orphaned. Rollback is idempotent: "nothing to roll back" is success,
//! not an error, so the watchdog can retry compensation safely.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::error::BillingError;
use crate::task::model::{TaskBillingInfo, TaskRecord};

/// Outcome of a rollback attempt.
///
/// `attempted` is false when the stored billing info owed nothing (not
/// billable, no freeze id, shadow/off mode, or already settled/rolled back).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub attempted: bool,
    pub rolled_back: bool,
}

impl RollbackOutcome {
    pub fn skipped() -> Self {
        Self { attempted: false, rolled_back: false }
    }
}

/// An active hold on a user's balance.
#[derive(Debug, Clone)]
pub struct BillingHold {
    pub freeze_id: String,
    pub mode_snapshot: String,
    pub amount: i64,
}

impl BillingHold {
    /// Serialize into the `billing_info` JSON stored on the ledger row.
    pub fn to_billing_info(&self) -> Value {
        json!({
            "billable": true,
            "freezeId": self.freeze_id,
            "modeSnapshot": self.mode_snapshot,
            "status": "frozen",
            "amount": self.amount,
        })
    }
}

/// External billing ledger.
#[async_trait]
pub trait BillingLedger: Send + Sync {
    /// Place a hold of `amount` credits on the user's balance.
    async fn freeze(
        &self,
        task_id: Uuid,
        user_id: &str,
        amount: i64,
    ) -> Result<BillingHold, BillingError>;

    /// Consume a hold after the task succeeded.
    async fn settle(&self, task_id: Uuid, freeze_id: &str) -> Result<(), BillingError>;

    /// Release a hold back to the user's balance. Must be idempotent: a
    /// freeze id that no longer exists is treated as already released.
    async fn rollback(&self, task_id: Uuid, freeze_id: &str) -> Result<(), BillingError>;
}

/// Roll back whatever the stored billing info owes for this task.
///
/// Reads the row's billing info leniently; malformed or absent info means
/// there is nothing to do. Returns the outcome rather than erroring on the
/// skip path so callers can distinguish "nothing owed" from "rollback ran".
pub async fn rollback_for_task(
    ledger: &dyn BillingLedger,
    task: &TaskRecord,
) -> Result<RollbackOutcome, BillingError> {
    let Some(info) = TaskBillingInfo::parse(task.billing_info.as_ref()) else {
        return Ok(RollbackOutcome::skipped());
    };
    if !info.needs_rollback() {
        return Ok(RollbackOutcome::skipped());
    }
    // needs_rollback guarantees the freeze id is present.
    let Some(freeze_id) = info.freeze_id.as_deref() else {
        return Ok(RollbackOutcome::skipped());
    };
    ledger.rollback(task.id, freeze_id).await?;
    debug!(task_id = %task.id, freeze_id, "Billing hold rolled back");
    Ok(RollbackOutcome { attempted: true, rolled_back: true })
}

/// Mark stored billing info as rolled back so later sweeps skip it.
pub fn billing_info_rolled_back(info: &Value) -> Value {
    let mut updated = info.clone();
    if let Some(obj) = updated.as_object_mut() {
        obj.insert("status".to_string(), Value::String("rolled_back".to_string()));
    }
    updated
}

// ── In-memory implementation ────────────────────────────────────────

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, i64>,
    holds: HashMap<String, (String, i64)>, // freeze_id -> (user_id, amount)
}

/// In-memory billing ledger for local runs and tests.
pub struct InMemoryBillingLedger {
    state: Mutex<LedgerState>,
    mode: String,
}

impl InMemoryBillingLedger {
    pub fn new() -> Self {
        Self { state: Mutex::new(LedgerState::default()), mode: "ENFORCE".to_string() }
    }

    pub fn with_balance(self, user_id: &str, balance: i64) -> Self {
        {
            let mut state = self.lock();
            state.balances.insert(user_id.to_string(), balance);
        }
        self
    }

    pub fn balance_of(&self, user_id: &str) -> i64 {
        *self.lock().balances.get(user_id).unwrap_or(&0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // Lock poisoning only happens if a holder panicked; the state is
        // plain data, so continue with whatever is there.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryBillingLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BillingLedger for InMemoryBillingLedger {
    async fn freeze(
        &self,
        _task_id: Uuid,
        user_id: &str,
        amount: i64,
    ) -> Result<BillingHold, BillingError> {
        let mut state = self.lock();
        let balance = state.balances.entry(user_id.to_string()).or_insert(0);
        if *balance < amount {
            return Err(BillingError::InsufficientBalance {
                required: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        let freeze_id = Uuid::new_v4().to_string();
        state.holds.insert(freeze_id.clone(), (user_id.to_string(), amount));
        Ok(BillingHold { freeze_id, mode_snapshot: self.mode.clone(), amount })
    }

    async fn settle(&self, _task_id: Uuid, freeze_id: &str) -> Result<(), BillingError> {
        self.lock().holds.remove(freeze_id);
        Ok(())
    }

    async fn rollback(&self, _task_id: Uuid, freeze_id: &str) -> Result<(), BillingError> {
        let mut state = self.lock();
        if let Some((user_id, amount)) = state.holds.remove(freeze_id) {
            *state.balances.entry(user_id).or_insert(0) += amount;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{NewTask, TaskKind};
    use serde_json::json;

    fn task_with_billing(info: Option<Value>) -> TaskRecord {
        TaskRecord::new_queued(NewTask {
            kind: TaskKind::ImageCharacter,
            target_type: "CharacterAppearance".into(),
            target_id: "A1".into(),
            payload: json!({}),
            dedupe_key: None,
            billing_info: info,
            user_id: "u1".into(),
            project_id: "p1".into(),
            episode_id: None,
            priority: 0,
        })
    }

    #[tokio::test]
    async fn freeze_then_rollback_restores_balance() {
        let ledger = InMemoryBillingLedger::new().with_balance("u1", 100);
        let task_id = Uuid::new_v4();
        let hold = ledger.freeze(task_id, "u1", 30).await.unwrap();
        assert_eq!(ledger.balance_of("u1"), 70);

        ledger.rollback(task_id, &hold.freeze_id).await.unwrap();
        assert_eq!(ledger.balance_of("u1"), 100);

        // Second rollback of the same hold is a no-op.
        ledger.rollback(task_id, &hold.freeze_id).await.unwrap();
        assert_eq!(ledger.balance_of("u1"), 100);
    }

    #[tokio::test]
    async fn freeze_rejects_insufficient_balance() {
        let ledger = InMemoryBillingLedger::new().with_balance("u1", 10);
        let err = ledger.freeze(Uuid::new_v4(), "u1", 30).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientBalance { required: 30, available: 10 }));
        assert_eq!(ledger.balance_of("u1"), 10);
    }

    #[tokio::test]
    async fn settle_consumes_the_hold() {
        let ledger = InMemoryBillingLedger::new().with_balance("u1", 100);
        let task_id = Uuid::new_v4();
        let hold = ledger.freeze(task_id, "u1", 30).await.unwrap();
        ledger.settle(task_id, &hold.freeze_id).await.unwrap();

        // A settled hold cannot be rolled back.
        ledger.rollback(task_id, &hold.freeze_id).await.unwrap();
        assert_eq!(ledger.balance_of("u1"), 70);
    }

    #[tokio::test]
    async fn rollback_for_task_skips_when_nothing_owed() {
        let ledger = InMemoryBillingLedger::new();

        for info in [
            None,
            Some(json!({"billable": false})),
            Some(json!({"billable": true})), // no freeze id
            Some(json!({"billable": true, "freezeId": "f1", "modeSnapshot": "SHADOW"})),
            Some(json!({"billable": true, "freezeId": "f1", "status": "settled"})),
            Some(json!({"billable": true, "freezeId": "f1", "status": "rolled_back"})),
            Some(json!("not an object")),
        ] {
            let task = task_with_billing(info.clone());
            let outcome = rollback_for_task(&ledger, &task).await.unwrap();
            assert_eq!(outcome, RollbackOutcome::skipped(), "info: {info:?}");
        }
    }

    #[tokio::test]
    async fn rollback_for_task_runs_when_owed() {
        let ledger = InMemoryBillingLedger::new().with_balance("u1", 50);
        let task_id = Uuid::new_v4();
        let hold = ledger.freeze(task_id, "u1", 20).await.unwrap();

        let task = task_with_billing(Some(hold.to_billing_info()));
        let outcome = rollback_for_task(&ledger, &task).await.unwrap();
        assert_eq!(outcome, RollbackOutcome { attempted: true, rolled_back: true });
        assert_eq!(ledger.balance_of("u1"), 50);
    }

    #[test]
    fn billing_info_status_update() {
        let info = json!({"billable": true, "freezeId": "f1", "status": "frozen"});
        let updated = billing_info_rolled_back(&info);
        assert_eq!(updated["status"], "rolled_back");
        assert_eq!(updated["freezeId"], "f1");
    }
}
