//! Per-user daily computation budget
//!
//! Render time is charged against `User::computation_time`. The balance
//! refills to the daily allotment once `now` passes the user's reset instant,
//! and every change is written through a [`BudgetLedger`] right away, outside
//! whatever business transaction is open, so spent render time is never
//! refunded by a rollback.

use std::sync::Arc;

use async_trait::async_trait;
use time::{OffsetDateTime, UtcOffset, macros::time};
use tracing::{debug, info};

use crate::entities::User;
use crate::error::{Result, SnippetError};
use crate::settings::RenderSettings;

/// Stored budget fields of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetState {
    pub computation_time: i64,
    pub computation_time_reset: OffsetDateTime,
}

/// Persistence for budget fields of a user.
///
/// Both operations apply atomically to the stored row, independent of any
/// open transaction, and report the stored state afterwards. Concurrent
/// operations of the same user therefore never overwrite each other's charges.
#[async_trait]
pub trait BudgetLedger: Send + Sync {
    /// Set the balance to `allotment` and the reset instant to `next_reset`
    /// if the stored reset instant is at or before `now`.
    async fn refill_if_due(
        &self,
        user_id: i64,
        allotment: i64,
        now: OffsetDateTime,
        next_reset: OffsetDateTime,
    ) -> Result<BudgetState>;

    /// Deduct `amount` from the stored balance, never below zero, and return
    /// the new balance.
    async fn charge(&self, user_id: i64, amount: i64) -> Result<i64>;

    /// Stored balance of `user_id`
    async fn balance(&self, user_id: i64) -> Result<i64>;
}

/// Enforces and accounts the daily computation budget
#[derive(Clone)]
pub struct ComputationBudget {
    ledger: Arc<dyn BudgetLedger>,
    daily_allotment_ms: i64,
    reset_offset: UtcOffset,
}

impl ComputationBudget {
    pub fn new(ledger: Arc<dyn BudgetLedger>, settings: &RenderSettings) -> Self {
        let reset_offset =
            UtcOffset::from_hms(settings.reset_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC);

        Self {
            ledger,
            daily_allotment_ms: settings.daily_allotment_ms,
            reset_offset,
        }
    }

    pub fn daily_allotment_ms(&self) -> i64 {
        self.daily_allotment_ms
    }

    /// Last second of the reference-timezone day containing `now`
    pub fn end_of_day(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.to_offset(self.reset_offset).replace_time(time!(23:59:59))
    }

    /// Refill the budget if the reset instant has passed, otherwise refuse
    /// users whose balance is used up.
    ///
    /// Called once per top-level operation, not per rendered version.
    pub async fn check_and_maybe_reset(&self, user: &mut User, now: OffsetDateTime) -> Result<()> {
        let state = self
            .ledger
            .refill_if_due(user.id, self.daily_allotment_ms, now, self.end_of_day(now))
            .await?;

        if state.computation_time_reset > user.computation_time_reset {
            info!(
                "Refilled computation budget of user {} until {}",
                user.public_id, state.computation_time_reset
            );
        }
        user.computation_time = state.computation_time;
        user.computation_time_reset = state.computation_time_reset;

        if user.computation_time <= 0 {
            debug!("User {} has no computation time left", user.public_id);
            return Err(SnippetError::insufficient_budget(0));
        }

        Ok(())
    }

    /// Pick up the stored balance, including charges made by other
    /// operations of the same user since `user` was loaded.
    pub async fn refresh(&self, user: &mut User) -> Result<()> {
        user.computation_time = self.ledger.balance(user.id).await?;
        Ok(())
    }

    /// Make sure the balance can absorb one more render of `needed` ms.
    /// `rendered` is how many versions of the current batch are already done.
    pub fn ensure_covers(&self, user: &User, needed: u64, rendered: usize) -> Result<()> {
        if user.computation_time < needed as i64 {
            debug!(
                "User {} has {}ms left, {}ms needed",
                user.public_id, user.computation_time, needed
            );
            return Err(SnippetError::insufficient_budget(rendered));
        }
        Ok(())
    }

    /// Deduct `amount` ms and persist at once. The balance never drops below
    /// zero; `user` picks up the stored balance, charges of concurrent
    /// operations included.
    pub async fn charge(&self, user: &mut User, amount: u64) -> Result<()> {
        let amount = i64::try_from(amount).unwrap_or(i64::MAX);
        user.computation_time = self.ledger.charge(user.id, amount).await?;
        debug!(
            "Charged {}ms to user {}, {}ms left",
            amount, user.public_id, user.computation_time
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use time::{Duration, macros::datetime};

    /// Ledger holding budget rows in memory and remembering every charged
    /// balance
    #[derive(Default)]
    pub(crate) struct RecordingLedger {
        rows: Mutex<HashMap<i64, BudgetState>>,
        pub saved: Mutex<Vec<i64>>,
    }

    impl RecordingLedger {
        pub(crate) fn holding(user: &User) -> Self {
            let ledger = Self::default();
            ledger.rows.lock().unwrap().insert(
                user.id,
                BudgetState {
                    computation_time: user.computation_time,
                    computation_time_reset: user.computation_time_reset,
                },
            );
            ledger
        }

        pub(crate) fn stored(&self, user_id: i64) -> i64 {
            self.rows.lock().unwrap()[&user_id].computation_time
        }
    }

    #[async_trait]
    impl BudgetLedger for RecordingLedger {
        async fn refill_if_due(
            &self,
            user_id: i64,
            allotment: i64,
            now: OffsetDateTime,
            next_reset: OffsetDateTime,
        ) -> Result<BudgetState> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(&user_id).ok_or_else(|| SnippetError::not_found("user"))?;
            if now >= row.computation_time_reset {
                row.computation_time = allotment;
                row.computation_time_reset = next_reset;
                self.saved.lock().unwrap().push(allotment);
            }
            Ok(*row)
        }

        async fn charge(&self, user_id: i64, amount: i64) -> Result<i64> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(&user_id).ok_or_else(|| SnippetError::not_found("user"))?;
            row.computation_time = row.computation_time.saturating_sub(amount).max(0);
            self.saved.lock().unwrap().push(row.computation_time);
            Ok(row.computation_time)
        }

        async fn balance(&self, user_id: i64) -> Result<i64> {
            Ok(self.stored(user_id))
        }
    }

    pub(crate) fn user_with(balance: i64, reset: OffsetDateTime) -> User {
        User {
            id: 1,
            public_id: "a1b2c3d4e5f6a7b8".into(),
            username: "alice".into(),
            computation_time: balance,
            computation_time_reset: reset,
            capabilities: crate::policy::default_capabilities(),
            deleted_at: None,
        }
    }

    fn budget(ledger: Arc<RecordingLedger>) -> ComputationBudget {
        ComputationBudget::new(ledger, &RenderSettings::default())
    }

    #[tokio::test]
    async fn test_refill_after_reset_instant() {
        let now = datetime!(2025-03-10 14:30:00 UTC);
        let mut user = user_with(0, now - Duration::hours(1));
        let ledger = Arc::new(RecordingLedger::holding(&user));
        let budget = budget(ledger.clone());

        budget.check_and_maybe_reset(&mut user, now).await.unwrap();

        assert_eq!(user.computation_time, 60_000);
        assert_eq!(user.computation_time_reset, datetime!(2025-03-10 23:59:59 UTC));
        assert_eq!(*ledger.saved.lock().unwrap(), vec![60_000]);
    }

    #[tokio::test]
    async fn test_reset_exactly_at_boundary() {
        let now = datetime!(2025-03-10 23:59:59 UTC);
        let mut user = user_with(10, now);
        let budget = budget(Arc::new(RecordingLedger::holding(&user)));

        budget.check_and_maybe_reset(&mut user, now).await.unwrap();
        assert_eq!(user.computation_time, 60_000);
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_blocked() {
        let now = datetime!(2025-03-10 08:00:00 UTC);
        let mut user = user_with(0, datetime!(2025-03-10 23:59:59 UTC));
        let ledger = Arc::new(RecordingLedger::holding(&user));
        let budget = budget(ledger.clone());

        let err = budget.check_and_maybe_reset(&mut user, now).await.unwrap_err();
        assert!(matches!(err, SnippetError::InsufficientBudget { .. }));
        assert!(ledger.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_reads_stored_balance() {
        let now = datetime!(2025-03-10 08:00:00 UTC);
        let reset = datetime!(2025-03-10 23:59:59 UTC);
        let ledger = Arc::new(RecordingLedger::holding(&user_with(0, reset)));
        let budget = budget(ledger);

        // loaded before another request spent the rest of the day
        let mut stale = user_with(9_000, reset);
        let err = budget.check_and_maybe_reset(&mut stale, now).await.unwrap_err();
        assert!(matches!(err, SnippetError::InsufficientBudget { .. }));
        assert_eq!(stale.computation_time, 0);
    }

    #[tokio::test]
    async fn test_charge_persists_and_saturates() {
        let mut user = user_with(3_000, OffsetDateTime::now_utc() + Duration::hours(1));
        let ledger = Arc::new(RecordingLedger::holding(&user));
        let budget = budget(ledger.clone());

        budget.charge(&mut user, 1_200).await.unwrap();
        budget.charge(&mut user, 5_000).await.unwrap();

        assert_eq!(user.computation_time, 0);
        assert_eq!(*ledger.saved.lock().unwrap(), vec![1_800, 0]);
    }

    #[tokio::test]
    async fn test_charges_from_stale_copies_accumulate() {
        let user = user_with(10_000, OffsetDateTime::now_utc() + Duration::hours(1));
        let ledger = Arc::new(RecordingLedger::holding(&user));
        let budget = budget(ledger.clone());

        let mut first = user.clone();
        let mut second = user.clone();
        budget.charge(&mut first, 4_000).await.unwrap();
        budget.charge(&mut second, 4_000).await.unwrap();

        assert_eq!(ledger.stored(user.id), 2_000);
        assert_eq!(second.computation_time, 2_000);

        let mut stale = user.clone();
        budget.refresh(&mut stale).await.unwrap();
        assert!(budget.ensure_covers(&stale, 5_000, 0).is_err());
    }

    #[test]
    fn test_end_of_day_uses_reference_offset() {
        let settings = RenderSettings {
            reset_offset_hours: 2,
            ..RenderSettings::default()
        };
        let budget = ComputationBudget::new(Arc::new(RecordingLedger::default()), &settings);

        // 23:30 UTC is already the next day at UTC+2
        let end = budget.end_of_day(datetime!(2025-03-10 23:30:00 UTC));
        assert_eq!(end, datetime!(2025-03-11 23:59:59 +2));
    }

    #[test]
    fn test_ensure_covers() {
        let budget = budget(Arc::new(RecordingLedger::default()));
        let user = user_with(4_000, OffsetDateTime::now_utc());

        assert!(budget.ensure_covers(&user, 4_000, 0).is_ok());
        match budget.ensure_covers(&user, 5_000, 1) {
            Err(SnippetError::InsufficientBudget { stage }) => {
                assert_eq!(stage, crate::error::BudgetStage::AfterPartial { rendered: 1 })
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
