//! Banking ledger module (single-balance accounts, event-sourced).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod ledger;

pub use ledger::{
    Account, AccountClosed, AccountLedger, AccountOpened, CloseAccount, Deposit, FundsDeposited,
    FundsWithdrawn, LedgerCommand, LedgerError, LedgerEvent, LedgerId, OpenAccount, Withdraw,
};
