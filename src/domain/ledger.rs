use super::operation::{OperationId, PayerReference};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use thiserror::Error;

/// A monetary value held in a wallet.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// A strictly positive amount of money requested from a payer.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(LedgerError::InvalidAmount(value))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Balance {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },
    #[error("no price available for coin {0}")]
    PriceUnavailable(String),
    #[error("listing {0} not found")]
    UnknownListing(String),
    #[error("withdrawal {0} not found")]
    UnknownWithdrawal(String),
    #[error("operation is missing its subject id")]
    MissingSubject,
    #[error("invalid state change: {0}")]
    InvalidState(String),
    #[error("ledger storage error: {0}")]
    Storage(String),
    #[error("arithmetic overflow: {0}")]
    Overflow(String),
}

impl LedgerError {
    /// Transient errors may clear up on their own (funds not yet visible, storage hiccup).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientFunds { .. }
                | LedgerError::PriceUnavailable(_)
                | LedgerError::Storage(_)
        )
    }
}

/// A trader's wallet: a fiat balance funded by mobile money plus coin holdings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub owner: PayerReference,
    pub balance: Balance,
    #[serde(default)]
    pub holdings: HashMap<String, Decimal>,
}

impl Wallet {
    pub fn new(owner: PayerReference) -> Self {
        Self {
            owner,
            balance: Balance::ZERO,
            holdings: HashMap::new(),
        }
    }

    pub fn credit(&mut self, amount: Balance) -> Result<(), LedgerError> {
        self.balance.0 = self.balance.0.checked_add(amount.0).ok_or_else(|| {
            LedgerError::Overflow(format!("crediting {} to wallet {}", amount.0, self.owner))
        })?;
        Ok(())
    }

    /// Spends `amount` from the balance on `coin` at `price` per unit.
    pub fn purchase(
        &mut self,
        coin: &str,
        amount: Balance,
        price: Decimal,
    ) -> Result<Decimal, LedgerError> {
        if price <= Decimal::ZERO {
            return Err(LedgerError::PriceUnavailable(coin.to_string()));
        }
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                needed: amount.0,
                available: self.balance.0,
            });
        }
        let units = amount.0.checked_div(price).ok_or_else(|| {
            LedgerError::Overflow(format!("buying {coin} with {} at {price}", amount.0))
        })?;
        let holding = self
            .holding(coin)
            .checked_add(units)
            .ok_or_else(|| LedgerError::Overflow(format!("{coin} holding of {}", self.owner)))?;
        self.balance -= amount;
        self.holdings.insert(coin.to_string(), holding);
        Ok(units)
    }

    pub fn holding(&self, coin: &str) -> Decimal {
        self.holdings.get(coin).copied().unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    AwaitingFee,
    PendingApproval,
    Active,
    Rejected,
}

/// A coin listing created by a user; goes live after its creation fee is paid and approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinListing {
    pub id: String,
    pub creator: PayerReference,
    pub fee_paid: bool,
    pub status: ListingStatus,
}

impl CoinListing {
    pub fn new(id: impl Into<String>, creator: PayerReference) -> Self {
        Self {
            id: id.into(),
            creator,
            fee_paid: false,
            status: ListingStatus::AwaitingFee,
        }
    }

    pub fn mark_fee_paid(&mut self) -> Result<(), LedgerError> {
        match self.status {
            ListingStatus::AwaitingFee => {
                self.fee_paid = true;
                self.status = ListingStatus::PendingApproval;
                Ok(())
            }
            other => Err(LedgerError::InvalidState(format!(
                "listing {} is {:?}, not awaiting its fee",
                self.id, other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Requested,
    Completed,
}

/// A payout request approved by an admin and settled through mobile money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub payee: PayerReference,
    pub amount: Amount,
    pub status: WithdrawalStatus,
}

impl Withdrawal {
    pub fn new(id: impl Into<String>, payee: PayerReference, amount: Amount) -> Self {
        Self {
            id: id.into(),
            payee,
            amount,
            status: WithdrawalStatus::Requested,
        }
    }

    pub fn complete(&mut self) -> Result<(), LedgerError> {
        match self.status {
            WithdrawalStatus::Requested => {
                self.status = WithdrawalStatus::Completed;
                Ok(())
            }
            WithdrawalStatus::Completed => Err(LedgerError::InvalidState(format!(
                "withdrawal {} already completed",
                self.id
            ))),
        }
    }
}

/// One dependent state change applied after a payment succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEntry {
    Credit {
        wallet: PayerReference,
        amount: Amount,
    },
    Purchase {
        wallet: PayerReference,
        coin: String,
        amount: Amount,
        price: Decimal,
    },
    FeePaid {
        listing: String,
    },
    WithdrawalCompleted {
        withdrawal: String,
    },
}

impl LedgerEntry {
    /// Key distinguishing the entries one operation may apply.
    pub fn step(&self) -> &'static str {
        match self {
            LedgerEntry::Credit { .. } => "credit",
            LedgerEntry::Purchase { .. } => "purchase",
            LedgerEntry::FeePaid { .. } => "fee_paid",
            LedgerEntry::WithdrawalCompleted { .. } => "withdrawal_completed",
        }
    }

    /// Key recording that `operation` applied this entry.
    pub fn marker(&self, operation: &OperationId) -> String {
        format!("{operation}/{}", self.step())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerReceipt {
    Applied,
    AlreadyApplied,
}

/// Wallets, listings and withdrawals plus the markers of entries already applied.
///
/// Applying an entry and recording its marker happen in the same `&mut self` call,
/// so whoever persists the book persists both or neither.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerBook {
    pub wallets: HashMap<PayerReference, Wallet>,
    pub listings: HashMap<String, CoinListing>,
    pub withdrawals: HashMap<String, Withdrawal>,
    applied: HashSet<String>,
}

impl LedgerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_applied(&self, operation: &OperationId, entry: &LedgerEntry) -> bool {
        self.applied.contains(&entry.marker(operation))
    }

    /// Applies `entry` once per (operation, step). A failed entry leaves the book untouched.
    pub fn apply(
        &mut self,
        operation: &OperationId,
        entry: &LedgerEntry,
    ) -> Result<LedgerReceipt, LedgerError> {
        if self.is_applied(operation, entry) {
            return Ok(LedgerReceipt::AlreadyApplied);
        }
        match entry {
            LedgerEntry::Credit { wallet, amount } => {
                self.wallets
                    .entry(wallet.clone())
                    .or_insert_with(|| Wallet::new(wallet.clone()))
                    .credit((*amount).into())?;
            }
            LedgerEntry::Purchase {
                wallet,
                coin,
                amount,
                price,
            } => {
                let target = self
                    .wallets
                    .get_mut(wallet)
                    .ok_or(LedgerError::InsufficientFunds {
                        needed: amount.value(),
                        available: Decimal::ZERO,
                    })?;
                target.purchase(coin, (*amount).into(), *price)?;
            }
            LedgerEntry::FeePaid { listing } => self
                .listings
                .get_mut(listing)
                .ok_or_else(|| LedgerError::UnknownListing(listing.clone()))?
                .mark_fee_paid()?,
            LedgerEntry::WithdrawalCompleted { withdrawal } => self
                .withdrawals
                .get_mut(withdrawal)
                .ok_or_else(|| LedgerError::UnknownWithdrawal(withdrawal.clone()))?
                .complete()?,
        }
        self.applied.insert(entry.marker(operation));
        Ok(LedgerReceipt::Applied)
    }
}
