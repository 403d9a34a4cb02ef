use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Billing subject keys are normalized URIs: scheme stripped, user part
/// only, leading `+` removed, re-anchored at the canonical `localhost`
/// marker domain.
pub fn normalize_user(uri: &str) -> String {
    let bare = uri
        .trim()
        .trim_start_matches("sips:")
        .trim_start_matches("sip:");
    let user = bare.split('@').next().unwrap_or(bare);
    let user = user.trim_start_matches('+');
    format!("sip:{}@localhost", user)
}

/// Balance authority consulted on call admission and charged by the
/// billing workers. Mutations serialize on the writer lock; reads share
/// the reader side.
pub trait Ledger: Send + Sync {
    /// Whether `from` may place a call. Unknown users are permitted so a
    /// freshly registered endpoint is not locked out; operators opt in to
    /// gating by provisioning a balance.
    fn can_call(&self, from: &str, to: &str) -> Result<bool, LedgerError>;

    /// Charge `amount` from `user`. Fails atomically without touching the
    /// balance when funds are short; unknown users are a successful no-op.
    fn deduct(&self, user: &str, amount: f64) -> Result<(), LedgerError>;

    fn set_balance(&self, user: &str, amount: f64);

    fn balance_of(&self, user: &str) -> Option<f64>;

    fn list_accounts(&self) -> Vec<(String, f64)>;

    fn remove_account(&self, user: &str);
}

/// Balances are held in integer micro-units so repeated per-second
/// deductions stay exact; a call with balance 0.03 at rate 0.01 survives
/// exactly three ticks. The trait surface stays in display units.
const MICROS_PER_UNIT: f64 = 1_000_000.0;

fn to_micros(amount: f64) -> u64 {
    (amount.max(0.0) * MICROS_PER_UNIT).round() as u64
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_UNIT
}

#[derive(Default)]
pub struct MemoryLedger {
    balances: RwLock<HashMap<String, u64>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn can_call(&self, from: &str, _to: &str) -> Result<bool, LedgerError> {
        let from = normalize_user(from);
        let balances = self.balances.read().unwrap();
        match balances.get(&from) {
            Some(balance) => Ok(*balance > 0),
            None => {
                debug!(user = %from, "no balance on record, permitting call");
                Ok(true)
            }
        }
    }

    fn deduct(&self, user: &str, amount: f64) -> Result<(), LedgerError> {
        let user = normalize_user(user);
        let amount = to_micros(amount);
        let mut balances = self.balances.write().unwrap();
        match balances.get_mut(&user) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                Ok(())
            }
            Some(_) => Err(LedgerError::InsufficientFunds),
            None => Ok(()),
        }
    }

    fn set_balance(&self, user: &str, amount: f64) {
        let user = normalize_user(user);
        self.balances.write().unwrap().insert(user, to_micros(amount));
    }

    fn balance_of(&self, user: &str) -> Option<f64> {
        self.balances
            .read()
            .unwrap()
            .get(&normalize_user(user))
            .map(|micros| from_micros(*micros))
    }

    fn list_accounts(&self) -> Vec<(String, f64)> {
        self.balances
            .read()
            .unwrap()
            .iter()
            .map(|(user, balance)| (user.clone(), from_micros(*balance)))
            .collect()
    }

    fn remove_account(&self, user: &str) {
        self.balances.write().unwrap().remove(&normalize_user(user));
    }
}
