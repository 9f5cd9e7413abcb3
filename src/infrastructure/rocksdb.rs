use super::change_feed::BroadcastChangeFeed;
use crate::domain::gateway::CorrelationId;
use crate::domain::ledger::{
    CoinListing, LedgerBook, LedgerEntry, LedgerError, LedgerReceipt, Wallet, Withdrawal,
};
use crate::domain::operation::{
    CompletionMark, OperationId, OperationStatus, PayerReference, PendingOperation, Transition,
};
use crate::domain::ports::{LedgerStore, OperationStore};
use crate::error::{ConfirmError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for pending operations, keyed by operation id.
pub const CF_OPERATIONS: &str = "operations";
/// Column Family for wallets, keyed by payer reference.
pub const CF_WALLETS: &str = "wallets";
/// Column Family for coin listings, keyed by listing id.
pub const CF_LISTINGS: &str = "listings";
/// Column Family for withdrawals, keyed by withdrawal id.
pub const CF_WITHDRAWALS: &str = "withdrawals";
/// Column Family of applied ledger entries, keyed `{operation}/{step}` with empty values.
pub const CF_APPLIED: &str = "applied";

const COLUMN_FAMILIES: [&str; 5] = [
    CF_OPERATIONS,
    CF_WALLETS,
    CF_LISTINGS,
    CF_WITHDRAWALS,
    CF_APPLIED,
];

/// A persistent store for operations and the ledger using RocksDB.
///
/// Read-modify-write cycles are serialized by one async mutex, so status writes
/// stay compare-and-set within this process. A ledger entry's changed entities
/// and its applied marker go out in one `WriteBatch`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
    feed: BroadcastChangeFeed,
}

fn encoding_error(context: &str, e: serde_json::Error) -> ConfirmError {
    ConfirmError::InternalError(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{context} error: {e}"),
    )))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| encoding_error("Serialization", e))
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that every column family of the store exists.
    pub fn open<P: AsRef<Path>>(path: P, feed: BroadcastChangeFeed) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            feed,
        })
    }

    pub fn feed(&self) -> &BroadcastChangeFeed {
        &self.feed
    }

    fn handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            ConfirmError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.handle(cf_name)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| encoding_error("Deserialization", e)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.handle(cf_name)?;
        self.db.put_cf(cf, key, to_json(value)?)?;
        Ok(())
    }

    async fn update<F>(&self, id: &OperationId, mutate: F) -> Result<Transition>
    where
        F: FnOnce(&mut PendingOperation) -> bool + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut operation: PendingOperation = self
            .get_json(CF_OPERATIONS, id.as_str().as_bytes())?
            .ok_or_else(|| ConfirmError::NotFound(id.clone()))?;
        let previous = operation.status;
        if !mutate(&mut operation) {
            return Ok(Transition::Rejected(operation));
        }
        self.put_json(CF_OPERATIONS, id.as_str().as_bytes(), &operation)?;
        if operation.status != previous {
            self.feed.publish(&operation);
        }
        Ok(Transition::Applied(operation))
    }

    /// Loads just the entities `entry` touches into a scratch book.
    fn book_for(&self, entry: &LedgerEntry) -> Result<LedgerBook> {
        let mut book = LedgerBook::new();
        match entry {
            LedgerEntry::Credit { wallet, .. } | LedgerEntry::Purchase { wallet, .. } => {
                if let Some(found) = self.get_json(CF_WALLETS, wallet.as_str().as_bytes())? {
                    book.wallets.insert(wallet.clone(), found);
                }
            }
            LedgerEntry::FeePaid { listing } => {
                if let Some(found) = self.get_json(CF_LISTINGS, listing.as_bytes())? {
                    book.listings.insert(listing.clone(), found);
                }
            }
            LedgerEntry::WithdrawalCompleted { withdrawal } => {
                if let Some(found) = self.get_json(CF_WITHDRAWALS, withdrawal.as_bytes())? {
                    book.withdrawals.insert(withdrawal.clone(), found);
                }
            }
        }
        Ok(book)
    }

    async fn apply_entry(
        &self,
        operation: &OperationId,
        entry: &LedgerEntry,
    ) -> Result<LedgerReceipt> {
        let _guard = self.write_lock.lock().await;
        let marker = entry.marker(operation);
        let cf_applied = self.handle(CF_APPLIED)?;
        if self.db.get_pinned_cf(cf_applied, marker.as_bytes())?.is_some() {
            return Ok(LedgerReceipt::AlreadyApplied);
        }

        let mut book = self.book_for(entry)?;
        book.apply(operation, entry)?;

        let mut batch = WriteBatch::default();
        let cf_wallets = self.handle(CF_WALLETS)?;
        for (owner, wallet) in &book.wallets {
            batch.put_cf(cf_wallets, owner.as_str().as_bytes(), to_json(wallet)?);
        }
        let cf_listings = self.handle(CF_LISTINGS)?;
        for (id, listing) in &book.listings {
            batch.put_cf(cf_listings, id.as_bytes(), to_json(listing)?);
        }
        let cf_withdrawals = self.handle(CF_WITHDRAWALS)?;
        for (id, withdrawal) in &book.withdrawals {
            batch.put_cf(cf_withdrawals, id.as_bytes(), to_json(withdrawal)?);
        }
        batch.put_cf(cf_applied, marker.as_bytes(), b"");
        self.db.write(batch)?;
        Ok(LedgerReceipt::Applied)
    }
}

#[async_trait]
impl OperationStore for RocksDBStore {
    async fn create(&self, operation: PendingOperation) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = operation.id.as_str().as_bytes();
        let cf = self.handle(CF_OPERATIONS)?;
        // Just check if the key exists without retrieving the value
        if self.db.get_pinned_cf(cf, key)?.is_some() {
            return Err(ConfirmError::ValidationError(format!(
                "operation {} already exists",
                operation.id
            )));
        }
        self.put_json(CF_OPERATIONS, key, &operation)
    }

    async fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>> {
        self.get_json(CF_OPERATIONS, id.as_str().as_bytes())
    }

    async fn attach_correlation(
        &self,
        id: &OperationId,
        correlation: CorrelationId,
    ) -> Result<Transition> {
        self.update(id, |op| op.attach_correlation(correlation)).await
    }

    async fn transition(
        &self,
        id: &OperationId,
        status: OperationStatus,
        detail: Option<String>,
    ) -> Result<Transition> {
        self.update(id, |op| op.transition(status, detail)).await
    }

    async fn claim_completion(&self, id: &OperationId) -> Result<bool> {
        let transition = self.update(id, PendingOperation::claim_completion).await?;
        Ok(transition.applied())
    }

    async fn settle_completion(&self, id: &OperationId, mark: CompletionMark) -> Result<()> {
        self.update(id, |op| {
            op.completion = mark;
            true
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn apply(
        &self,
        operation: &OperationId,
        entry: LedgerEntry,
    ) -> std::result::Result<LedgerReceipt, LedgerError> {
        self.apply_entry(operation, &entry)
            .await
            .map_err(|e| match e {
                ConfirmError::LedgerError(inner) => inner,
                other => LedgerError::Storage(other.to_string()),
            })
    }

    async fn wallet(&self, owner: &PayerReference) -> Result<Option<Wallet>> {
        self.get_json(CF_WALLETS, owner.as_str().as_bytes())
    }

    async fn register_listing(&self, listing: CoinListing) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.put_json(CF_LISTINGS, listing.id.as_bytes(), &listing)
    }

    async fn listing(&self, id: &str) -> Result<Option<CoinListing>> {
        self.get_json(CF_LISTINGS, id.as_bytes())
    }

    async fn register_withdrawal(&self, withdrawal: Withdrawal) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.put_json(CF_WITHDRAWALS, withdrawal.id.as_bytes(), &withdrawal)
    }

    async fn withdrawal(&self, id: &str) -> Result<Option<Withdrawal>> {
        self.get_json(CF_WITHDRAWALS, id.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ledger::{Amount, Balance};
    use crate::domain::operation::NewOperation;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn open(path: &Path) -> RocksDBStore {
        RocksDBStore::open(path, BroadcastChangeFeed::new(16)).expect("Failed to open RocksDB")
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        // Verify CFs exist
        for name in COLUMN_FAMILIES {
            assert!(store.db.cf_handle(name).is_some(), "{name} missing");
        }
    }

    #[tokio::test]
    async fn test_rocksdb_operation_store() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let op = PendingOperation::create(NewOperation::deposit(
            PayerReference::new("254700000010"),
            Amount::new(dec!(25)).unwrap(),
        ));
        store.create(op.clone()).await.unwrap();
        assert_eq!(store.get(&op.id).await.unwrap().unwrap(), op);
        assert!(store.create(op.clone()).await.is_err());

        let won = store
            .transition(&op.id, OperationStatus::Succeeded, None)
            .await
            .unwrap();
        assert!(won.applied());
        let lost = store
            .transition(&op.id, OperationStatus::TimedOut, None)
            .await
            .unwrap();
        assert!(!lost.applied());
        assert_eq!(
            store.get(&op.id).await.unwrap().unwrap().status,
            OperationStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let payer = PayerReference::new("254700000011");
        let op = OperationId::from("op-persist");
        let entry = LedgerEntry::Credit {
            wallet: payer.clone(),
            amount: Amount::new(dec!(70)).unwrap(),
        };
        {
            let store = open(dir.path());
            assert_eq!(
                store.apply(&op, entry.clone()).await.unwrap(),
                LedgerReceipt::Applied
            );
        }

        let store = open(dir.path());
        assert_eq!(
            store.apply(&op, entry).await.unwrap(),
            LedgerReceipt::AlreadyApplied
        );
        let wallet = store.wallet(&payer).await.unwrap().unwrap();
        assert_eq!(wallet.balance, Balance::new(dec!(70)));
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_keys_each_entity() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let first = PayerReference::new("254700000012");
        let second = PayerReference::new("254700000013");
        let op = OperationId::from("op-keys");
        let credit = LedgerEntry::Credit {
            wallet: first.clone(),
            amount: Amount::new(dec!(5)).unwrap(),
        };
        store.apply(&op, credit.clone()).await.unwrap();
        store
            .apply(
                &OperationId::from("op-keys-2"),
                LedgerEntry::Credit {
                    wallet: second.clone(),
                    amount: Amount::new(dec!(8)).unwrap(),
                },
            )
            .await
            .unwrap();

        let wallets = store.handle(CF_WALLETS).unwrap();
        assert!(store.db.get_pinned_cf(wallets, first.as_str()).unwrap().is_some());
        assert!(store.db.get_pinned_cf(wallets, second.as_str()).unwrap().is_some());
        let applied = store.handle(CF_APPLIED).unwrap();
        assert!(store.db.get_pinned_cf(applied, credit.marker(&op)).unwrap().is_some());
        assert_eq!(
            store.wallet(&second).await.unwrap().unwrap().balance,
            Balance::new(dec!(8))
        );
    }

    #[tokio::test]
    async fn test_rocksdb_failed_entry_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let payer = PayerReference::new("254700000014");
        let op = OperationId::from("op-nothing");
        let purchase = LedgerEntry::Purchase {
            wallet: payer.clone(),
            coin: "MOON".into(),
            amount: Amount::new(dec!(10)).unwrap(),
            price: dec!(2),
        };

        let err = store.apply(&op, purchase.clone()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.wallet(&payer).await.unwrap().is_none());
        let applied = store.handle(CF_APPLIED).unwrap();
        assert!(store.db.get_pinned_cf(applied, purchase.marker(&op)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rocksdb_listing_fee_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let creator = PayerReference::new("254700000015");
        store
            .register_listing(CoinListing::new("coin-9", creator))
            .await
            .unwrap();
        let op = OperationId::from("op-fee");
        let fee = LedgerEntry::FeePaid {
            listing: "coin-9".into(),
        };
        assert_eq!(store.apply(&op, fee.clone()).await.unwrap(), LedgerReceipt::Applied);
        assert_eq!(
            store.apply(&op, fee).await.unwrap(),
            LedgerReceipt::AlreadyApplied
        );
        assert!(store.listing("coin-9").await.unwrap().unwrap().fee_paid);
    }
}
