//! Contracts the engine consumes but does not implement: the possession-token
//! issuer and the escrow payment rail. In-memory implementations back the
//! server binary and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::{Account, Payout, TokenId, Wei};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    Rejected(String),
    Unavailable(String),
}

impl std::fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollaboratorError::Rejected(reason) => write!(f, "rejected: {reason}"),
            CollaboratorError::Unavailable(reason) => write!(f, "unavailable: {reason}"),
        }
    }
}

impl std::error::Error for CollaboratorError {}

/// Issues one possession token per booked stay.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn mint(&self, owner: &Account, stay_id: Ulid) -> Result<TokenId, CollaboratorError>;

    /// Undo a mint whose booking could not be committed.
    async fn burn(&self, token_id: TokenId) -> Result<(), CollaboratorError>;
}

/// Moves escrowed funds out to their recipients.
#[async_trait]
pub trait PaymentRail: Send + Sync {
    /// Settle both legs of `payout`, or neither.
    async fn pay(&self, payout: &Payout) -> Result<(), CollaboratorError>;
}

/// Hands out token ids 1, 2, 3, … and remembers who holds each.
#[derive(Debug)]
pub struct SequentialIssuer {
    next: AtomicU64,
    tokens: DashMap<TokenId, (Account, Ulid)>,
}

impl Default for SequentialIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl SequentialIssuer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            tokens: DashMap::new(),
        }
    }

    pub fn owner_of(&self, token_id: TokenId) -> Option<Account> {
        self.tokens.get(&token_id).map(|e| e.value().0.clone())
    }

    pub fn stay_of(&self, token_id: TokenId) -> Option<Ulid> {
        self.tokens.get(&token_id).map(|e| e.value().1)
    }

    pub fn minted(&self) -> usize {
        self.tokens.len()
    }
}

#[async_trait]
impl TokenIssuer for SequentialIssuer {
    async fn mint(&self, owner: &Account, stay_id: Ulid) -> Result<TokenId, CollaboratorError> {
        let token_id = self.next.fetch_add(1, Ordering::SeqCst);
        self.tokens.insert(token_id, (owner.clone(), stay_id));
        Ok(token_id)
    }

    async fn burn(&self, token_id: TokenId) -> Result<(), CollaboratorError> {
        self.tokens
            .remove(&token_id)
            .map(|_| ())
            .ok_or_else(|| CollaboratorError::Rejected(format!("unknown token {token_id}")))
    }
}

/// Credits payout legs to per-account balances. Both legs are applied under
/// one lock so a payout is never half-settled.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    balances: Mutex<HashMap<Account, Wei>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: &Account) -> Wei {
        self.balances
            .lock()
            .map(|b| b.get(account).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl PaymentRail for InMemoryLedger {
    async fn pay(&self, payout: &Payout) -> Result<(), CollaboratorError> {
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("ledger lock poisoned".into()))?;

        let owner_balance = balances.get(&payout.owner).copied().unwrap_or(0);
        let charity_balance = balances.get(&payout.charity).copied().unwrap_or(0);
        let (owner_next, charity_next) = if payout.owner == payout.charity {
            let both = owner_balance
                .checked_add(payout.total())
                .ok_or_else(|| CollaboratorError::Rejected("balance overflow".into()))?;
            (both, both)
        } else {
            (
                owner_balance
                    .checked_add(payout.owner_amount)
                    .ok_or_else(|| CollaboratorError::Rejected("balance overflow".into()))?,
                charity_balance
                    .checked_add(payout.charity_amount)
                    .ok_or_else(|| CollaboratorError::Rejected("balance overflow".into()))?,
            )
        };

        balances.insert(payout.owner.clone(), owner_next);
        balances.insert(payout.charity.clone(), charity_next);
        Ok(())
    }
}

/// Everything outside the engine that the engine calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub issuer: Arc<dyn TokenIssuer>,
    pub rail: Arc<dyn PaymentRail>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(issuer: Arc<dyn TokenIssuer>, rail: Arc<dyn PaymentRail>, clock: Arc<dyn Clock>) -> Self {
        Self { issuer, rail, clock }
    }

    /// In-memory issuer and ledger on the system clock.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(SequentialIssuer::new()),
            Arc::new(InMemoryLedger::new()),
            Arc::new(SystemClock),
        )
    }
}
