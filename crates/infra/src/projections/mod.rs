//! Projection implementations (read model builders).
//!
//! Projections consume domain events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: Can be reconstructed from the event stream
//! - **Idempotent**: Safe for at-least-once delivery

pub mod account_balances;

pub use account_balances::{
    AccountBalancesProjection, AccountBalancesProjectionError, AccountReadModel, LedgerSummary,
};
