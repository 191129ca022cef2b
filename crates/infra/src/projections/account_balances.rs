//! Account balances projection.
//!
//! Tracks per-customer account state derived from ledger events, plus a
//! ledger-wide summary (open-account count, total value held). The aggregate
//! remains the source of truth; this read model exists for queries that
//! should not rehydrate a stream.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use thiserror::Error;

use minibank_core::{AggregateId, CustomerId};
use minibank_events::{EventEnvelope, Projection};
use minibank_ledger::LedgerEvent;

use crate::read_model::ReadModelStore;

/// Stream type this projection consumes.
pub const LEDGER_AGGREGATE_TYPE: &str = "bank.ledger";

/// Read model: one customer's account as seen by queries.
///
/// `total_deposited`/`total_withdrawn` are lifetime totals and survive a
/// close/reopen cycle; `balance` resets with the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountReadModel {
    pub customer_id: CustomerId,
    pub balance: u64,
    pub is_open: bool,
    pub total_deposited: u64,
    pub total_withdrawn: u64,
}

impl AccountReadModel {
    pub fn new(customer_id: CustomerId) -> Self {
        Self {
            customer_id,
            balance: 0,
            is_open: false,
            total_deposited: 0,
            total_withdrawn: 0,
        }
    }
}

/// Ledger-wide totals over the read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSummary {
    pub accounts_opened: u64,
    pub total_held: u64,
}

#[derive(Debug, Error)]
pub enum AccountBalancesProjectionError {
    #[error("failed to deserialize ledger event: {0}")]
    Deserialize(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Account balances projection: builds customer account read models.
///
/// Rebuildable from ledger events. Idempotent via per-stream sequence
/// cursors, so at-least-once delivery from the bus is safe.
#[derive(Debug)]
pub struct AccountBalancesProjection<S>
where
    S: ReadModelStore<CustomerId, AccountReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> AccountBalancesProjection<S>
where
    S: ReadModelStore<CustomerId, AccountReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    fn get_cursor(&self, aggregate_id: AggregateId) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => *cursors.get(&aggregate_id).unwrap_or(&0),
            Err(_) => 0,
        }
    }

    fn update_cursor(&self, aggregate_id: AggregateId, sequence_number: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(aggregate_id, sequence_number);
        }
    }

    /// Account read model for a specific customer.
    pub fn get(&self, customer_id: &CustomerId) -> Option<AccountReadModel> {
        self.store.get(customer_id)
    }

    /// All known accounts (open and closed).
    pub fn list(&self) -> Vec<AccountReadModel> {
        self.store.list()
    }

    /// Currently open accounts.
    pub fn list_open(&self) -> Vec<AccountReadModel> {
        self.store.list().into_iter().filter(|a| a.is_open).collect()
    }

    /// Ledger-wide summary: open-account count and total value held.
    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for account in self.store.list() {
            if account.is_open {
                summary.accounts_opened += 1;
                summary.total_held += account.balance;
            }
        }
        summary
    }

    fn apply_event(&self, ev: LedgerEvent) {
        match ev {
            LedgerEvent::AccountOpened(e) => {
                let mut account = self
                    .store
                    .get(&e.customer_id)
                    .unwrap_or_else(|| AccountReadModel::new(e.customer_id));
                account.balance = 0;
                account.is_open = true;
                self.store.upsert(e.customer_id, account);
            }
            LedgerEvent::FundsDeposited(e) => {
                let mut account = self
                    .store
                    .get(&e.customer_id)
                    .unwrap_or_else(|| AccountReadModel::new(e.customer_id));
                account.balance = e.new_balance;
                account.total_deposited += e.amount;
                self.store.upsert(e.customer_id, account);
            }
            LedgerEvent::FundsWithdrawn(e) => {
                let mut account = self
                    .store
                    .get(&e.customer_id)
                    .unwrap_or_else(|| AccountReadModel::new(e.customer_id));
                account.balance = e.new_balance;
                account.total_withdrawn += e.amount;
                self.store.upsert(e.customer_id, account);
            }
            LedgerEvent::AccountClosed(e) => {
                if let Some(mut account) = self.store.get(&e.customer_id) {
                    account.balance = 0;
                    account.is_open = false;
                    self.store.upsert(e.customer_id, account);
                }
            }
        }
    }

    /// Rebuild the read model from scratch.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), AccountBalancesProjectionError> {
        self.store.clear();
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}

impl<S> Projection<JsonValue> for AccountBalancesProjection<S>
where
    S: ReadModelStore<CustomerId, AccountReadModel>,
{
    type Error = AccountBalancesProjectionError;

    /// Apply an envelope into the account read models.
    ///
    /// Envelopes for other aggregate types are ignored. Duplicate deliveries
    /// (sequence number at or below the cursor) are skipped; a gap in the
    /// sequence is an error, since applying out of order would corrupt the
    /// read model.
    fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), AccountBalancesProjectionError> {
        if envelope.aggregate_type() != LEDGER_AGGREGATE_TYPE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        let last = self.get_cursor(aggregate_id);

        if seq == 0 {
            return Err(AccountBalancesProjectionError::NonMonotonicSequence { last, found: seq });
        }

        if seq <= last {
            return Ok(());
        }

        if seq != last + 1 && last != 0 {
            return Err(AccountBalancesProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let ev: LedgerEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| AccountBalancesProjectionError::Deserialize(e.to_string()))?;

        self.apply_event(ev);
        self.update_cursor(aggregate_id, seq);
        Ok(())
    }
}
