use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use minibank_core::{Aggregate, AggregateId, AggregateRoot, CustomerId, DomainError, Entity};
use minibank_events::Event;

/// Deterministic ledger failure.
///
/// The `Display` strings are the reason strings surfaced verbatim to callers;
/// "User has an account already!" and "User does not have an account" are part
/// of the external contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Attempted open while an open account already exists for the caller.
    #[error("User has an account already!")]
    AlreadyHasAccount,

    /// Attempted deposit/withdraw/close/balance-check with no open account.
    #[error("User does not have an account")]
    NoAccount,

    /// Withdrawal amount exceeds the current balance.
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u64, available: u64 },

    /// Deposit would overflow the balance representation.
    #[error("deposit would overflow balance")]
    BalanceOverflow,
}

impl From<LedgerError> for DomainError {
    fn from(value: LedgerError) -> Self {
        DomainError::invariant(value.to_string())
    }
}

/// One customer's relationship to the ledger.
///
/// Existence in the ledger's map is the open flag: closing removes the record,
/// reopening creates a fresh zero-balance one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub owner: CustomerId,
    /// Amount held, in smallest unit. Never negative by construction.
    pub balance: u64,
}

impl Entity for Account {
    type Id = CustomerId;

    fn id(&self) -> &Self::Id {
        &self.owner
    }
}

/// Ledger identifier (aggregate id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(pub AggregateId);

impl LedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for LedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Command: open an account for `customer_id` with a zero balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAccount {
    pub ledger_id: LedgerId,
    pub customer_id: CustomerId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: add `amount` to the caller's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub ledger_id: LedgerId,
    pub customer_id: CustomerId,
    /// Quantity of value transferred in by the caller (zero is allowed).
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: subtract `amount` from the caller's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdraw {
    pub ledger_id: LedgerId,
    pub customer_id: CustomerId,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: close the caller's account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseAccount {
    pub ledger_id: LedgerId,
    pub customer_id: CustomerId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    OpenAccount(OpenAccount),
    Deposit(Deposit),
    Withdraw(Withdraw),
    CloseAccount(CloseAccount),
}

/// Event: an account was opened (balance starts at zero).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    pub ledger_id: LedgerId,
    pub customer_id: CustomerId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: funds were deposited into an open account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsDeposited {
    pub ledger_id: LedgerId,
    pub customer_id: CustomerId,
    pub amount: u64,
    /// Balance after the deposit (for projections).
    pub new_balance: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: funds were withdrawn from an open account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsWithdrawn {
    pub ledger_id: LedgerId,
    pub customer_id: CustomerId,
    pub amount: u64,
    /// Balance after the withdrawal (for projections).
    pub new_balance: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: an account was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClosed {
    pub ledger_id: LedgerId,
    pub customer_id: CustomerId,
    /// Balance held at close time.
    pub final_balance: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    AccountOpened(AccountOpened),
    FundsDeposited(FundsDeposited),
    FundsWithdrawn(FundsWithdrawn),
    AccountClosed(AccountClosed),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::AccountOpened(_) => "bank.account.opened",
            LedgerEvent::FundsDeposited(_) => "bank.funds.deposited",
            LedgerEvent::FundsWithdrawn(_) => "bank.funds.withdrawn",
            LedgerEvent::AccountClosed(_) => "bank.account.closed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::AccountOpened(e) => e.occurred_at,
            LedgerEvent::FundsDeposited(e) => e.occurred_at,
            LedgerEvent::FundsWithdrawn(e) => e.occurred_at,
            LedgerEvent::AccountClosed(e) => e.occurred_at,
        }
    }
}

/// Aggregate root: AccountLedger.
///
/// Owns the customer → account map and the aggregate open-account counter.
/// Every operation is guarded here: one account per customer, balance
/// mutations only on open accounts, withdrawals capped at the balance.
/// `accounts_opened` always equals the number of open accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLedger {
    id: LedgerId,
    accounts: HashMap<CustomerId, Account>,
    accounts_opened: u64,
    version: u64,
}

impl AccountLedger {
    /// Empty aggregate for rehydration.
    pub fn empty(id: LedgerId) -> Self {
        Self {
            id,
            accounts: HashMap::new(),
            accounts_opened: 0,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> LedgerId {
        self.id
    }

    /// Number of currently open accounts.
    pub fn accounts_opened(&self) -> u64 {
        self.accounts_opened
    }

    pub fn has_account(&self, customer_id: &CustomerId) -> bool {
        self.accounts.contains_key(customer_id)
    }

    pub fn account(&self, customer_id: &CustomerId) -> Option<&Account> {
        self.accounts.get(customer_id)
    }

    /// Current balance for `customer_id`.
    ///
    /// Fails with `NoAccount` when no open account exists, so "no account" is
    /// distinguishable from an open account holding zero.
    pub fn check_balance(&self, customer_id: &CustomerId) -> Result<u64, LedgerError> {
        self.accounts
            .get(customer_id)
            .map(|a| a.balance)
            .ok_or(LedgerError::NoAccount)
    }
}

impl AggregateRoot for AccountLedger {
    type Id = LedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for AccountLedger {
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = LedgerError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::AccountOpened(e) => {
                self.id = e.ledger_id;
                self.accounts.insert(
                    e.customer_id,
                    Account {
                        owner: e.customer_id,
                        balance: 0,
                    },
                );
                self.accounts_opened += 1;
            }
            LedgerEvent::FundsDeposited(e) => {
                if let Some(account) = self.accounts.get_mut(&e.customer_id) {
                    account.balance = e.new_balance;
                }
            }
            LedgerEvent::FundsWithdrawn(e) => {
                if let Some(account) = self.accounts.get_mut(&e.customer_id) {
                    account.balance = e.new_balance;
                }
            }
            LedgerEvent::AccountClosed(e) => {
                if self.accounts.remove(&e.customer_id).is_some() {
                    self.accounts_opened -= 1;
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LedgerCommand::OpenAccount(cmd) => self.handle_open(cmd),
            LedgerCommand::Deposit(cmd) => self.handle_deposit(cmd),
            LedgerCommand::Withdraw(cmd) => self.handle_withdraw(cmd),
            LedgerCommand::CloseAccount(cmd) => self.handle_close(cmd),
        }
    }
}

impl AccountLedger {
    fn handle_open(&self, cmd: &OpenAccount) -> Result<Vec<LedgerEvent>, LedgerError> {
        if self.accounts.contains_key(&cmd.customer_id) {
            return Err(LedgerError::AlreadyHasAccount);
        }

        Ok(vec![LedgerEvent::AccountOpened(AccountOpened {
            ledger_id: cmd.ledger_id,
            customer_id: cmd.customer_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deposit(&self, cmd: &Deposit) -> Result<Vec<LedgerEvent>, LedgerError> {
        let account = self
            .accounts
            .get(&cmd.customer_id)
            .ok_or(LedgerError::NoAccount)?;

        let new_balance = account
            .balance
            .checked_add(cmd.amount)
            .ok_or(LedgerError::BalanceOverflow)?;

        Ok(vec![LedgerEvent::FundsDeposited(FundsDeposited {
            ledger_id: cmd.ledger_id,
            customer_id: cmd.customer_id,
            amount: cmd.amount,
            new_balance,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_withdraw(&self, cmd: &Withdraw) -> Result<Vec<LedgerEvent>, LedgerError> {
        let account = self
            .accounts
            .get(&cmd.customer_id)
            .ok_or(LedgerError::NoAccount)?;

        if cmd.amount > account.balance {
            return Err(LedgerError::InsufficientBalance {
                requested: cmd.amount,
                available: account.balance,
            });
        }

        Ok(vec![LedgerEvent::FundsWithdrawn(FundsWithdrawn {
            ledger_id: cmd.ledger_id,
            customer_id: cmd.customer_id,
            amount: cmd.amount,
            new_balance: account.balance - cmd.amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_close(&self, cmd: &CloseAccount) -> Result<Vec<LedgerEvent>, LedgerError> {
        let account = self
            .accounts
            .get(&cmd.customer_id)
            .ok_or(LedgerError::NoAccount)?;

        Ok(vec![LedgerEvent::AccountClosed(AccountClosed {
            ledger_id: cmd.ledger_id,
            customer_id: cmd.customer_id,
            final_balance: account.balance,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minibank_core::AggregateId;
    use proptest::prelude::*;

    fn test_ledger_id() -> LedgerId {
        LedgerId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    /// Decide + apply in one step (what the dispatcher does for real).
    fn execute(
        ledger: &mut AccountLedger,
        command: LedgerCommand,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let events = ledger.handle(&command)?;
        for event in &events {
            ledger.apply(event);
        }
        Ok(events)
    }

    fn open(ledger: &mut AccountLedger, customer_id: CustomerId) -> Result<(), LedgerError> {
        execute(
            ledger,
            LedgerCommand::OpenAccount(OpenAccount {
                ledger_id: ledger.id_typed(),
                customer_id,
                occurred_at: test_time(),
            }),
        )
        .map(|_| ())
    }

    fn deposit(
        ledger: &mut AccountLedger,
        customer_id: CustomerId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        execute(
            ledger,
            LedgerCommand::Deposit(Deposit {
                ledger_id: ledger.id_typed(),
                customer_id,
                amount,
                occurred_at: test_time(),
            }),
        )
        .map(|_| ())
    }

    fn withdraw(
        ledger: &mut AccountLedger,
        customer_id: CustomerId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        execute(
            ledger,
            LedgerCommand::Withdraw(Withdraw {
                ledger_id: ledger.id_typed(),
                customer_id,
                amount,
                occurred_at: test_time(),
            }),
        )
        .map(|_| ())
    }

    fn close(ledger: &mut AccountLedger, customer_id: CustomerId) -> Result<(), LedgerError> {
        execute(
            ledger,
            LedgerCommand::CloseAccount(CloseAccount {
                ledger_id: ledger.id_typed(),
                customer_id,
                occurred_at: test_time(),
            }),
        )
        .map(|_| ())
    }

    #[test]
    fn fresh_ledger_has_no_open_accounts() {
        let ledger = AccountLedger::empty(test_ledger_id());
        assert_eq!(ledger.accounts_opened(), 0);
    }

    #[test]
    fn open_account_emits_event_and_increments_counter() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let customer = CustomerId::new();
        let ledger_id = ledger.id_typed();

        let events = execute(
            &mut ledger,
            LedgerCommand::OpenAccount(OpenAccount {
                ledger_id,
                customer_id: customer,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            LedgerEvent::AccountOpened(e) => assert_eq!(e.customer_id, customer),
            other => panic!("expected AccountOpened, got {other:?}"),
        }
        assert_eq!(ledger.accounts_opened(), 1);
        assert_eq!(ledger.check_balance(&customer).unwrap(), 0);
    }

    #[test]
    fn multiple_customers_can_open_accounts() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        for _ in 0..3 {
            open(&mut ledger, CustomerId::new()).unwrap();
        }
        assert_eq!(ledger.accounts_opened(), 3);
    }

    #[test]
    fn second_open_is_rejected_and_counter_unchanged() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let customer = CustomerId::new();

        open(&mut ledger, customer).unwrap();
        let err = open(&mut ledger, customer).unwrap_err();

        assert_eq!(err, LedgerError::AlreadyHasAccount);
        assert_eq!(err.to_string(), "User has an account already!");
        assert_eq!(ledger.accounts_opened(), 1);
    }

    #[test]
    fn deposit_is_reflected_in_balance() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let customer = CustomerId::new();

        open(&mut ledger, customer).unwrap();
        deposit(&mut ledger, customer, 1).unwrap();

        assert_eq!(ledger.check_balance(&customer).unwrap(), 1);
    }

    #[test]
    fn deposit_without_account_is_rejected() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let err = deposit(&mut ledger, CustomerId::new(), 10).unwrap_err();
        assert_eq!(err, LedgerError::NoAccount);
    }

    #[test]
    fn withdraw_without_account_is_rejected() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let err = withdraw(&mut ledger, CustomerId::new(), 1).unwrap_err();

        assert_eq!(err, LedgerError::NoAccount);
        assert_eq!(err.to_string(), "User does not have an account");
    }

    #[test]
    fn withdraw_above_balance_is_rejected_without_mutation() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let customer = CustomerId::new();

        open(&mut ledger, customer).unwrap();
        deposit(&mut ledger, customer, 50).unwrap();

        let err = withdraw(&mut ledger, customer, 51).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                requested: 51,
                available: 50
            }
        );
        assert_eq!(ledger.check_balance(&customer).unwrap(), 50);
    }

    #[test]
    fn withdraw_decreases_balance() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let customer = CustomerId::new();

        open(&mut ledger, customer).unwrap();
        deposit(&mut ledger, customer, 50).unwrap();
        withdraw(&mut ledger, customer, 20).unwrap();

        assert_eq!(ledger.check_balance(&customer).unwrap(), 30);
    }

    #[test]
    fn close_decrements_counter() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let user1 = CustomerId::new();
        let user2 = CustomerId::new();

        open(&mut ledger, user1).unwrap();
        open(&mut ledger, user2).unwrap();
        assert_eq!(ledger.accounts_opened(), 2);

        close(&mut ledger, user1).unwrap();
        assert_eq!(ledger.accounts_opened(), 1);
        assert!(!ledger.has_account(&user1));
        assert!(ledger.has_account(&user2));
    }

    #[test]
    fn close_without_account_is_rejected() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let err = close(&mut ledger, CustomerId::new()).unwrap_err();
        assert_eq!(err, LedgerError::NoAccount);
    }

    #[test]
    fn reopen_after_close_starts_from_zero() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let customer = CustomerId::new();

        open(&mut ledger, customer).unwrap();
        deposit(&mut ledger, customer, 100).unwrap();
        close(&mut ledger, customer).unwrap();

        assert_eq!(ledger.check_balance(&customer), Err(LedgerError::NoAccount));

        open(&mut ledger, customer).unwrap();
        assert_eq!(ledger.check_balance(&customer).unwrap(), 0);
    }

    #[test]
    fn deposit_overflow_is_rejected() {
        let mut ledger = AccountLedger::empty(test_ledger_id());
        let customer = CustomerId::new();

        open(&mut ledger, customer).unwrap();
        deposit(&mut ledger, customer, u64::MAX).unwrap();

        let err = deposit(&mut ledger, customer, 1).unwrap_err();
        assert_eq!(err, LedgerError::BalanceOverflow);
        assert_eq!(ledger.check_balance(&customer).unwrap(), u64::MAX);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: N distinct customers each opening once yields
        /// `accounts_opened == N`.
        #[test]
        fn counter_matches_distinct_opens(n in 0usize..40) {
            let mut ledger = AccountLedger::empty(test_ledger_id());

            for _ in 0..n {
                open(&mut ledger, CustomerId::new()).unwrap();
            }

            prop_assert_eq!(ledger.accounts_opened(), n as u64);
        }

        /// Property: after any command sequence, the counter equals the number
        /// of open accounts and every balance matches a naive model.
        #[test]
        fn ledger_agrees_with_naive_model(
            ops in prop::collection::vec((0u8..4, 0usize..4, 0u64..1_000), 1..60)
        ) {
            let mut ledger = AccountLedger::empty(test_ledger_id());
            let customers: Vec<CustomerId> = (0..4).map(|_| CustomerId::new()).collect();
            let mut model: HashMap<CustomerId, u64> = HashMap::new();

            for (op, who, amount) in ops {
                let customer = customers[who];
                match op {
                    0 => {
                        let result = open(&mut ledger, customer);
                        if model.contains_key(&customer) {
                            prop_assert_eq!(result, Err(LedgerError::AlreadyHasAccount));
                        } else {
                            prop_assert!(result.is_ok());
                            model.insert(customer, 0);
                        }
                    }
                    1 => {
                        let result = deposit(&mut ledger, customer, amount);
                        match model.get_mut(&customer) {
                            Some(balance) => {
                                prop_assert!(result.is_ok());
                                *balance += amount;
                            }
                            None => prop_assert_eq!(result, Err(LedgerError::NoAccount)),
                        }
                    }
                    2 => {
                        let result = withdraw(&mut ledger, customer, amount);
                        match model.get_mut(&customer) {
                            Some(balance) if amount <= *balance => {
                                prop_assert!(result.is_ok());
                                *balance -= amount;
                            }
                            Some(balance) => {
                                prop_assert_eq!(
                                    result,
                                    Err(LedgerError::InsufficientBalance {
                                        requested: amount,
                                        available: *balance,
                                    })
                                );
                            }
                            None => prop_assert_eq!(result, Err(LedgerError::NoAccount)),
                        }
                    }
                    _ => {
                        let result = close(&mut ledger, customer);
                        if model.remove(&customer).is_some() {
                            prop_assert!(result.is_ok());
                        } else {
                            prop_assert_eq!(result, Err(LedgerError::NoAccount));
                        }
                    }
                }
            }

            prop_assert_eq!(ledger.accounts_opened(), model.len() as u64);
            for (customer, balance) in &model {
                prop_assert_eq!(ledger.check_balance(customer), Ok(*balance));
            }
        }
    }
}
