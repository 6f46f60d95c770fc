use std::collections::BTreeMap;
use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use serde::{Deserialize, Serialize};

use crate::contracts::SmartContract;
use crate::errors::{ChainError, ChainResult};
use crate::reputation::ReputationRecord;
use crate::types::{Block, ProductId, Transaction};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const CF_BLOCKS: &str = "blocks";
const CF_PENDING: &str = "pending";
const CF_CONTRACTS: &str = "contracts";
const CF_REPUTATION: &str = "reputation";
const CF_PRODUCTS: &str = "products";
const CF_METADATA: &str = "metadata";
const COLUMN_FAMILIES: [&str; 6] = [
    CF_BLOCKS,
    CF_PENDING,
    CF_CONTRACTS,
    CF_REPUTATION,
    CF_PRODUCTS,
    CF_METADATA,
];
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const TIP_INDEX_KEY: &[u8] = b"tip_index";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductRegistration {
    pub product_id: ProductId,
    pub registered_at: u64,
}

/// Records produced by one stage event. Written together or not at all.
#[derive(Clone, Debug, Default)]
pub struct LedgerBatch {
    pub product: Option<ProductRegistration>,
    pub pending: Option<Transaction>,
    pub contracts: Vec<SmartContract>,
    pub reputations: Vec<ReputationRecord>,
}

/// Durable home of everything the ledger must rebuild on startup.
pub trait LedgerStore: Send + Sync {
    fn store_block(&self, block: &Block) -> ChainResult<()>;
    fn load_blocks(&self) -> ChainResult<Vec<Block>>;
    fn store_pending(&self, tx: &Transaction) -> ChainResult<()>;
    fn remove_pending(&self, sequences: &[u64]) -> ChainResult<()>;
    fn load_pending(&self) -> ChainResult<Vec<Transaction>>;
    fn store_contract(&self, contract: &SmartContract) -> ChainResult<()>;
    fn load_contracts(&self) -> ChainResult<Vec<SmartContract>>;
    fn store_reputation(&self, record: &ReputationRecord) -> ChainResult<()>;
    fn load_reputations(&self) -> ChainResult<Vec<ReputationRecord>>;
    fn store_product(&self, registration: &ProductRegistration) -> ChainResult<()>;
    fn load_products(&self) -> ChainResult<Vec<ProductRegistration>>;
    fn write_batch(&self, batch: &LedgerBatch) -> ChainResult<()>;
}

pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    fn cf(&self, name: &'static str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing {name} column family")))
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        match self.read_schema_version()? {
            Some(version) if version > STORAGE_SCHEMA_VERSION => Err(ChainError::Config(format!(
                "database schema version {version} is newer than supported {STORAGE_SCHEMA_VERSION}"
            ))),
            Some(version) if version < STORAGE_SCHEMA_VERSION => {
                Err(ChainError::MigrationRequired {
                    found: version,
                    required: STORAGE_SCHEMA_VERSION,
                })
            }
            Some(_) => Ok(()),
            None => {
                if self.is_empty()? {
                    self.write_schema_version(STORAGE_SCHEMA_VERSION)
                } else {
                    Err(ChainError::MigrationRequired {
                        found: 0,
                        required: STORAGE_SCHEMA_VERSION,
                    })
                }
            }
        }
    }

    fn is_empty(&self) -> ChainResult<bool> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let mut iter = self.db.iterator_cf(&blocks_cf, IteratorMode::Start);
        Ok(iter.next().transpose()?.is_none())
    }

    fn read_schema_version(&self) -> ChainResult<Option<u32>> {
        let metadata_cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&metadata_cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn write_schema_version(&self, version: u32) -> ChainResult<()> {
        let metadata_cf = self.cf(CF_METADATA)?;
        self.db
            .put_cf(&metadata_cf, SCHEMA_VERSION_KEY, version.to_be_bytes())?;
        Ok(())
    }

    pub fn schema_version(&self) -> ChainResult<u32> {
        Ok(self
            .read_schema_version()?
            .unwrap_or(STORAGE_SCHEMA_VERSION))
    }

    pub fn tip_index(&self) -> ChainResult<Option<u64>> {
        let metadata_cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&metadata_cf, TIP_INDEX_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid tip index encoding".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(&self, cf: &'static str, key: &[u8], value: &T) -> ChainResult<()> {
        let handle = self.cf(cf)?;
        let data = bincode::serialize(value)?;
        self.db.put_cf(&handle, key, data)?;
        Ok(())
    }

    fn batch_put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &'static str,
        key: &[u8],
        value: &T,
    ) -> ChainResult<()> {
        let handle = self.cf(cf)?;
        batch.put_cf(&handle, key, bincode::serialize(value)?);
        Ok(())
    }

    fn load_records<T: for<'de> Deserialize<'de>>(&self, cf: &'static str) -> ChainResult<Vec<T>> {
        let handle = self.cf(cf)?;
        let mut records = Vec::new();
        for entry in self.db.iterator_cf(&handle, IteratorMode::Start) {
            let (_key, value) = entry?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }
}

impl LedgerStore for Storage {
    fn store_block(&self, block: &Block) -> ChainResult<()> {
        self.put_record(CF_BLOCKS, &block.index.to_be_bytes(), block)?;
        let metadata_cf = self.cf(CF_METADATA)?;
        self.db
            .put_cf(&metadata_cf, TIP_INDEX_KEY, block.index.to_be_bytes())?;
        Ok(())
    }

    fn load_blocks(&self) -> ChainResult<Vec<Block>> {
        // Big-endian keys iterate in index order.
        self.load_records(CF_BLOCKS)
    }

    fn store_pending(&self, tx: &Transaction) -> ChainResult<()> {
        self.put_record(CF_PENDING, &tx.sequence.to_be_bytes(), tx)
    }

    fn remove_pending(&self, sequences: &[u64]) -> ChainResult<()> {
        let handle = self.cf(CF_PENDING)?;
        for sequence in sequences {
            self.db.delete_cf(&handle, sequence.to_be_bytes())?;
        }
        Ok(())
    }

    fn load_pending(&self) -> ChainResult<Vec<Transaction>> {
        self.load_records(CF_PENDING)
    }

    fn store_contract(&self, contract: &SmartContract) -> ChainResult<()> {
        self.put_record(CF_CONTRACTS, contract.contract_id.as_bytes(), contract)
    }

    fn load_contracts(&self) -> ChainResult<Vec<SmartContract>> {
        self.load_records(CF_CONTRACTS)
    }

    fn store_reputation(&self, record: &ReputationRecord) -> ChainResult<()> {
        self.put_record(CF_REPUTATION, record.farmer_id.as_bytes(), record)
    }

    fn load_reputations(&self) -> ChainResult<Vec<ReputationRecord>> {
        self.load_records(CF_REPUTATION)
    }

    fn store_product(&self, registration: &ProductRegistration) -> ChainResult<()> {
        self.put_record(
            CF_PRODUCTS,
            registration.product_id.as_bytes(),
            registration,
        )
    }

    fn load_products(&self) -> ChainResult<Vec<ProductRegistration>> {
        self.load_records(CF_PRODUCTS)
    }

    fn write_batch(&self, records: &LedgerBatch) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        if let Some(registration) = &records.product {
            self.batch_put(
                &mut batch,
                CF_PRODUCTS,
                registration.product_id.as_bytes(),
                registration,
            )?;
        }
        if let Some(tx) = &records.pending {
            self.batch_put(&mut batch, CF_PENDING, &tx.sequence.to_be_bytes(), tx)?;
        }
        for contract in &records.contracts {
            self.batch_put(&mut batch, CF_CONTRACTS, contract.contract_id.as_bytes(), contract)?;
        }
        for record in &records.reputations {
            self.batch_put(&mut batch, CF_REPUTATION, record.farmer_id.as_bytes(), record)?;
        }
        self.db.write(batch)?;
        Ok(())
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

/// Volatile store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    blocks: RwLock<BTreeMap<u64, Block>>,
    pending: RwLock<BTreeMap<u64, Transaction>>,
    contracts: RwLock<BTreeMap<String, SmartContract>>,
    reputations: RwLock<BTreeMap<String, ReputationRecord>>,
    products: RwLock<BTreeMap<String, ProductRegistration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a stored block without any checks. Lets tests simulate
    /// tampering with the durable copy.
    pub fn overwrite_block(&self, block: Block) {
        self.blocks.write().insert(block.index, block);
    }
}

impl LedgerStore for MemoryStore {
    fn store_block(&self, block: &Block) -> ChainResult<()> {
        self.blocks.write().insert(block.index, block.clone());
        Ok(())
    }

    fn load_blocks(&self) -> ChainResult<Vec<Block>> {
        Ok(self.blocks.read().values().cloned().collect())
    }

    fn store_pending(&self, tx: &Transaction) -> ChainResult<()> {
        self.pending.write().insert(tx.sequence, tx.clone());
        Ok(())
    }

    fn remove_pending(&self, sequences: &[u64]) -> ChainResult<()> {
        let mut pending = self.pending.write();
        for sequence in sequences {
            pending.remove(sequence);
        }
        Ok(())
    }

    fn load_pending(&self) -> ChainResult<Vec<Transaction>> {
        Ok(self.pending.read().values().cloned().collect())
    }

    fn store_contract(&self, contract: &SmartContract) -> ChainResult<()> {
        self.contracts
            .write()
            .insert(contract.contract_id.clone(), contract.clone());
        Ok(())
    }

    fn load_contracts(&self) -> ChainResult<Vec<SmartContract>> {
        Ok(self.contracts.read().values().cloned().collect())
    }

    fn store_reputation(&self, record: &ReputationRecord) -> ChainResult<()> {
        self.reputations
            .write()
            .insert(record.farmer_id.clone(), record.clone());
        Ok(())
    }

    fn load_reputations(&self) -> ChainResult<Vec<ReputationRecord>> {
        Ok(self.reputations.read().values().cloned().collect())
    }

    fn store_product(&self, registration: &ProductRegistration) -> ChainResult<()> {
        self.products
            .write()
            .insert(registration.product_id.clone(), registration.clone());
        Ok(())
    }

    fn load_products(&self) -> ChainResult<Vec<ProductRegistration>> {
        Ok(self.products.read().values().cloned().collect())
    }

    fn write_batch(&self, batch: &LedgerBatch) -> ChainResult<()> {
        if let Some(registration) = &batch.product {
            self.store_product(registration)?;
        }
        if let Some(tx) = &batch.pending {
            self.store_pending(tx)?;
        }
        for contract in &batch.contracts {
            self.store_contract(contract)?;
        }
        for record in &batch.reputations {
            self.store_reputation(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorRole, Stage, StageSubmission};
    use tempfile::tempdir;

    fn sample_tx(sequence: u64) -> Transaction {
        let event = StageSubmission::new("yam-3", Stage::Planted, ActorRole::Farmer, "f-4", "Man")
            .with_conditions(Some(21.5), Some(55.0))
            .finalize(500 + sequence);
        Transaction::new(sequence, event)
    }

    #[test]
    fn blocks_and_pending_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let genesis = Block::genesis();
        let block = Block::mine(1, 7, genesis.hash.clone(), vec![sample_tx(1)], 1, 100_000)
            .expect("mine");
        {
            let storage = Storage::open(dir.path()).expect("open");
            storage.store_block(&genesis).expect("store genesis");
            storage.store_block(&block).expect("store block");
            storage.store_pending(&sample_tx(2)).expect("pending 2");
            storage.store_pending(&sample_tx(3)).expect("pending 3");
            storage.remove_pending(&[2]).expect("remove");
        }

        let reopened = Storage::open(dir.path()).expect("reopen");
        assert_eq!(reopened.schema_version().expect("schema"), STORAGE_SCHEMA_VERSION);
        assert_eq!(reopened.tip_index().expect("tip"), Some(1));
        let blocks = reopened.load_blocks().expect("blocks");
        assert_eq!(blocks, vec![genesis, block]);
        let pending = reopened.load_pending().expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence, 3);
    }

    #[test]
    fn batch_writes_land_in_their_column_families() {
        let dir = tempdir().expect("tempdir");
        let registration = ProductRegistration {
            product_id: "yam-3".into(),
            registered_at: 500,
        };
        let record = ReputationRecord::new("f-4", &Default::default());
        {
            let storage = Storage::open(dir.path()).expect("open");
            storage
                .write_batch(&LedgerBatch {
                    product: Some(registration.clone()),
                    pending: Some(sample_tx(4)),
                    contracts: Vec::new(),
                    reputations: vec![record.clone()],
                })
                .expect("write batch");
        }

        let reopened = Storage::open(dir.path()).expect("reopen");
        assert_eq!(reopened.load_products().expect("products"), vec![registration]);
        assert_eq!(reopened.load_pending().expect("pending"), vec![sample_tx(4)]);
        assert_eq!(reopened.load_reputations().expect("reputations"), vec![record]);
        assert!(reopened.load_contracts().expect("contracts").is_empty());
    }

    #[test]
    fn products_are_keyed_by_id() {
        let store = MemoryStore::new();
        let registration = ProductRegistration {
            product_id: "cashew-1".into(),
            registered_at: 9,
        };
        store.store_product(&registration).expect("store");
        store.store_product(&registration).expect("store again");
        assert_eq!(store.load_products().expect("load"), vec![registration]);
    }
}
