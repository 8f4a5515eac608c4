//! Hash-linked transaction ledger (component E).
//!
//! The ledger tracks an append-only, hash-linked chain of blocks, each
//! wrapping one [`TransactionPayload`]. Blocks are validated
//! sequentially; there is no fork choice or multi-replica consensus
//! (explicitly out of scope, `spec.md` §1).
//!
//! Concurrency: `Ledger` itself holds no lock. Callers that share a
//! ledger across threads are expected to wrap it in a `Mutex` and hold
//! that lock only for the duration of `add_transaction`, per
//! `spec.md` §5 — image I/O and codec work should happen outside the
//! critical section.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transaction::{EmbedTransaction, TransactionPayload};

const GENESIS_PREV_HASH_HEX_LEN: usize = 64; // sha2/blake2-256 hex digest length
const LOCK_RETRY_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY_MS: u64 = 25;

/// Metadata identifying a block. The header is the portion hashed
/// alongside the payload; changing any field changes the block hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_number: u64,
    pub prev_hash: String,
    pub timestamp: f64,
    pub payload_hash: String,
}

/// A single ledger entry: header, transaction payload, a free-text
/// operation tag (`"genesis"`, `"embedder"`, `"remover"`), and this
/// block's own hash over `(header, transaction, info)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transaction: TransactionPayload,
    pub info: String,
    pub hash: String,
}

/// A record describing how an image hash was located in the ledger —
/// returned by both direct lookup and the provenance resolver, so
/// callers have one shape to deal with either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub ber: f64,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub timestamp: Option<f64>,
    pub info: String,
    pub image_hash: Option<String>,
}

/// Canonicalizes `value` to sorted-key, whitespace-free JSON bytes.
/// Going through `serde_json::Value` (backed by a `BTreeMap` because
/// this crate does not enable serde_json's `preserve_order` feature)
/// guarantees key order regardless of struct field declaration order
/// — required because block hashes are part of the persisted state
/// and must stay stable across processes and languages (`spec.md`
/// §4.E).
fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let as_value = serde_json::to_value(value)
        .map_err(|e| Error::LedgerCorrupt(format!("canonicalization failed: {e}")))?;
    serde_json::to_vec(&as_value)
        .map_err(|e| Error::LedgerCorrupt(format!("canonicalization failed: {e}")))
}

fn hash_hex(bytes: &[u8]) -> String {
    let digest = Blake2b512::digest(bytes);
    hex::encode(&digest[..32])
}

fn now_unix_seconds() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("time went backwards").as_secs_f64()
}

/// Computes the block hash over the canonical encoding of
/// `(header, transaction, info)`.
fn block_hash(header: &BlockHeader, transaction: &TransactionPayload, info: &str) -> Result<String> {
    #[derive(Serialize)]
    struct Hashable<'a> {
        header: &'a BlockHeader,
        transaction: &'a TransactionPayload,
        info: &'a str,
    }
    let bytes = canonical_bytes(&Hashable { header, transaction, info })?;
    Ok(hash_hex(&bytes))
}

fn genesis_block() -> Block {
    let header = BlockHeader {
        block_number: 0,
        prev_hash: "0".repeat(GENESIS_PREV_HASH_HEX_LEN),
        timestamp: now_unix_seconds(),
        payload_hash: hash_hex(&canonical_bytes(&TransactionPayload::Genesis).unwrap()),
    };
    let hash = block_hash(&header, &TransactionPayload::Genesis, "genesis").unwrap();
    Block { header, transaction: TransactionPayload::Genesis, info: "genesis".to_string(), hash }
}

/// A hash-linked, append-only chain of [`Block`]s persisted as a
/// single JSON document mapping stringified block numbers to blocks.
pub struct Ledger {
    path: PathBuf,
    blocks: BTreeMap<u64, Block>,
}

impl Ledger {
    /// Opens the ledger at `path`, loading it if present or creating
    /// a fresh chain containing only the genesis block.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| Error::LedgerCorrupt(format!("reading {}: {e}", path.display())))?;
            let by_key: BTreeMap<String, Block> = serde_json::from_str(&contents)
                .map_err(|e| Error::LedgerCorrupt(format!("parsing {}: {e}", path.display())))?;
            let mut blocks = BTreeMap::new();
            for (key, block) in by_key {
                let number: u64 = key
                    .parse()
                    .map_err(|_| Error::LedgerCorrupt(format!("non-numeric block key {key}")))?;
                blocks.insert(number, block);
            }
            let ledger = Ledger { path, blocks };
            if !ledger.verify_chain() {
                return Err(Error::LedgerCorrupt(format!(
                    "{} failed chain verification on open",
                    ledger.path.display()
                )));
            }
            Ok(ledger)
        } else {
            let mut blocks = BTreeMap::new();
            blocks.insert(0, genesis_block());
            let ledger = Ledger { path, blocks };
            ledger.persist()?;
            Ok(ledger)
        }
    }

    /// Number of blocks currently in the chain, genesis included.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        false // genesis is always present
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    fn tip(&self) -> &Block {
        self.blocks.values().last().expect("ledger always has a genesis block")
    }

    /// Appends a new block wrapping `payload`, tagged `info`, and
    /// persists the chain atomically (write-temp + rename) before
    /// returning. Hold an external lock around this call if the
    /// ledger is shared across threads.
    pub fn add_transaction(&mut self, payload: TransactionPayload, info: &str) -> Result<&Block> {
        let block_number = self.tip().header.block_number + 1;
        let prev_hash = self.tip().hash.clone();
        let payload_hash = hash_hex(&canonical_bytes(&payload)?);
        let header = BlockHeader {
            block_number,
            prev_hash,
            timestamp: now_unix_seconds(),
            payload_hash,
        };
        let hash = block_hash(&header, &payload, info)?;
        let block = Block { header, transaction: payload, info: info.to_string(), hash };

        self.blocks.insert(block_number, block);
        self.persist()?;
        Ok(self.blocks.get(&block_number).expect("just inserted"))
    }

    fn persist(&self) -> Result<()> {
        let by_key: BTreeMap<String, &Block> =
            self.blocks.iter().map(|(n, b)| (n.to_string(), b)).collect();
        let bytes = serde_json::to_vec_pretty(&by_key)
            .map_err(|e| Error::LedgerCorrupt(format!("serializing ledger: {e}")))?;

        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::Other(format!("creating ledger directory: {e}")))?;
            }
        }
        fs::write(&tmp_path, bytes)
            .map_err(|e| Error::Other(format!("writing {}: {e}", tmp_path.display())))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::Other(format!("renaming ledger into place: {e}")))?;
        Ok(())
    }

    /// Scans embed blocks for a transaction whose `hash_image_wat`
    /// equals `image_hash`. Returns `(None, None)` on a miss, which
    /// callers should follow up with the provenance resolver
    /// (`core::resolver`).
    pub fn get_transaction_history(
        &self,
        image_hash: &str,
    ) -> (Option<HistoryRecord>, Option<EmbedTransaction>) {
        for block in self.blocks.values() {
            if block.info != "embedder" {
                continue;
            }
            if let TransactionPayload::BatchEmbed(batch) = &block.transaction {
                if let Some(tx) = batch.transaction_dict.get(image_hash) {
                    let history = HistoryRecord {
                        ber: 0.0,
                        block_number: Some(block.header.block_number),
                        block_hash: Some(block.hash.clone()),
                        timestamp: Some(block.header.timestamp),
                        info: block.info.clone(),
                        image_hash: Some(image_hash.to_string()),
                    };
                    return (Some(history), Some(tx.clone()));
                }
            }
        }
        (None, None)
    }

    /// Re-derives every block's hash and checks chain linkage, block
    /// number contiguity, and that block 0 is the fixed genesis shape.
    pub fn verify_chain(&self) -> bool {
        let Some(genesis) = self.blocks.get(&0) else { return false };
        if genesis.header.block_number != 0
            || genesis.header.prev_hash != "0".repeat(GENESIS_PREV_HASH_HEX_LEN)
            || genesis.info != "genesis"
            || !matches!(genesis.transaction, TransactionPayload::Genesis)
        {
            return false;
        }

        let mut expected_number = 0u64;
        let mut prev_hash: Option<String> = None;
        for (&number, block) in &self.blocks {
            if number != expected_number {
                return false;
            }
            if let Some(expected_prev) = &prev_hash {
                if &block.header.prev_hash != expected_prev {
                    return false;
                }
            }
            let Ok(recomputed) = block_hash(&block.header, &block.transaction, &block.info) else {
                return false;
            };
            if recomputed != block.hash {
                return false;
            }
            let Ok(payload_bytes) = canonical_bytes(&block.transaction) else { return false };
            if hash_hex(&payload_bytes) != block.header.payload_hash {
                return false;
            }

            prev_hash = Some(block.hash.clone());
            expected_number += 1;
        }
        true
    }
}

/// Opens the ledger at `path`, appends one transaction, persists, and
/// closes — all under a simple cross-process file lock (an
/// exclusively-created `.lock` sibling file, retried with a short
/// backoff). Intended for callers that open a fresh `Ledger` per
/// command rather than holding one open across a process's lifetime
/// (the CLI's embed/extract/remove/batch entry points); in-process
/// callers that already hold a `&mut Ledger` across a batch run should
/// call [`Ledger::add_transaction`] directly instead.
pub fn append_locked(path: impl AsRef<Path>, payload: TransactionPayload, info: &str) -> Result<()> {
    let path = path.as_ref();
    let lock_path = path.with_extension("lock");

    let mut attempts = 0;
    loop {
        match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => break,
            Err(_) if attempts < LOCK_RETRY_ATTEMPTS => {
                attempts += 1;
                std::thread::sleep(std::time::Duration::from_millis(LOCK_RETRY_DELAY_MS));
            }
            Err(_) => {
                return Err(Error::LedgerContention(format!(
                    "could not acquire lock on {} after {} attempts",
                    lock_path.display(),
                    LOCK_RETRY_ATTEMPTS
                )))
            }
        }
    }

    let result = (|| -> Result<()> {
        let mut ledger = Ledger::open(path)?;
        ledger.add_transaction(payload, info)?;
        Ok(())
    })();

    let _ = fs::remove_file(&lock_path);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{BatchEmbedTransaction, TransactionDict};

    fn empty_batch_embed() -> TransactionPayload {
        TransactionPayload::BatchEmbed(BatchEmbedTransaction {
            timestamp: "2026-01-01T00:00:00".into(),
            total_images: 0,
            processed_images: 0,
            failed_images: vec![],
            processing_time_secs: 0.0,
            transaction_dict: TransactionDict::new(),
        })
    }

    #[test]
    fn genesis_block_has_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("chain.json")).unwrap();
        assert_eq!(ledger.len(), 1);
        let genesis = ledger.blocks().next().unwrap();
        assert_eq!(genesis.header.block_number, 0);
        assert_eq!(genesis.header.prev_hash, "0".repeat(64));
        assert_eq!(genesis.info, "genesis");
        assert!(matches!(genesis.transaction, TransactionPayload::Genesis));
    }

    #[test]
    fn append_only_and_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path().join("chain.json")).unwrap();
        ledger.add_transaction(empty_batch_embed(), "embedder").unwrap();
        ledger.add_transaction(empty_batch_embed(), "embedder").unwrap();
        assert_eq!(ledger.len(), 3);
        assert!(ledger.verify_chain());

        let numbers: Vec<u64> = ledger.blocks().map(|b| b.header.block_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn reopen_reloads_persisted_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        {
            let mut ledger = Ledger::open(&path).unwrap();
            ledger.add_transaction(empty_batch_embed(), "embedder").unwrap();
        }
        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.verify_chain());
    }

    #[test]
    fn corrupting_a_transaction_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        {
            let mut ledger = Ledger::open(&path).unwrap();
            ledger.add_transaction(empty_batch_embed(), "embedder").unwrap();
        }

        let raw_blocks: BTreeMap<String, Block> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let mut blocks = BTreeMap::new();
        for (k, v) in raw_blocks {
            blocks.insert(k.parse().unwrap(), v);
        }
        // Tamper with block 1's payload without recomputing its hash.
        if let Some(block) = blocks.get_mut(&1) {
            if let TransactionPayload::BatchEmbed(batch) = &mut block.transaction {
                batch.total_images = 9999;
            }
        }
        let tampered = Ledger { path: path.clone(), blocks };
        assert!(!tampered.verify_chain());
    }

    #[test]
    fn append_locked_cleans_up_its_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        Ledger::open(&path).unwrap();

        append_locked(&path, empty_batch_embed(), "embedder").unwrap();

        assert!(!path.with_extension("lock").exists());
        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn append_locked_reports_contention_on_a_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        Ledger::open(&path).unwrap();

        let lock_path = path.with_extension("lock");
        let _held = fs::File::create(&lock_path).unwrap();

        let err = append_locked(&path, empty_batch_embed(), "embedder").unwrap_err();
        assert!(matches!(err, Error::LedgerContention(_)));
    }
}
