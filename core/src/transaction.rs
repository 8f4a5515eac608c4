//! Typed transaction records (component D).
//!
//! The source represents these as ad-hoc Python dicts; here each kind
//! gets its own struct and the ledger stores them behind a tagged
//! [`TransactionPayload`] enum so that `serde_json` serialization
//! stays a single stable shape per kind — required for the ledger's
//! hashes to be reproducible (`spec.md` §4.E).

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

use crate::codec::CodecParams;

/// An insertion-ordered `String`-keyed dictionary that serializes as a
/// plain JSON object.
///
/// `spec.md` §4.F requires the provenance resolver to walk candidates
/// in "block order, then insertion order within the block's
/// transaction map" — the source's Python dict preserves insertion
/// order natively. A `BTreeMap` does not: it would silently re-sort
/// candidates by `hash_image_wat`/`watermarked_image_hash`, changing
/// which candidate wins first-match-wins determinism. This type keeps
/// entries in insertion (equivalently, on-disk) order for iteration
/// while still serializing as a JSON object, so the ledger's canonical
/// hashing (`core::ledger::canonical_bytes`, which goes through
/// `serde_json::Value`) sorts its keys exactly as it does for every
/// other map in a hashed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDict<V> {
    entries: Vec<(String, V)>,
}

impl<V> TransactionDict<V> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Inserts `value` under `key`, appending it after the current
    /// entries. Re-inserting an existing key updates its value without
    /// moving it, matching `dict.__setitem__`'s behavior on the
    /// source's ad-hoc transaction dicts.
    pub fn insert(&mut self, key: String, value: V) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for TransactionDict<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FromIterator<(String, V)> for TransactionDict<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut dict = Self::new();
        for (key, value) in iter {
            dict.insert(key, value);
        }
        dict
    }
}

impl<V: Serialize> Serialize for TransactionDict<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for TransactionDict<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DictVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for DictVisitor<V> {
            type Value = TransactionDict<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string keys to transaction records")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(TransactionDict { entries })
            }
        }

        deserializer.deserialize_map(DictVisitor(PhantomData))
    }
}

/// Record written for a single successful embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedTransaction {
    pub timestamp: String,
    pub data_type: String,
    pub hash_image_orig: String,
    pub hash_image_wat: String,
    pub secret_key: String,
    pub message: String,
    pub watermark: String,
    pub kernel: Vec<Vec<f64>>,
    pub stride: usize,
    pub t_hi: u32,
    pub bit_depth: u8,
    /// Traversal-order list of skipped/overflow center coordinates;
    /// see `core::codec`'s module docs for why this replaces an
    /// implicit pixel-stream trailer.
    pub overflow_positions: Vec<(u32, u32)>,
    pub info: String,
}

impl EmbedTransaction {
    pub fn codec_params(&self) -> CodecParams {
        CodecParams {
            kernel: crate::codec::Kernel { weights: self.kernel.clone() },
            stride: self.stride,
            t_hi: self.t_hi,
            bit_depth: self.bit_depth,
        }
    }
}

/// Record written for a single successful watermark removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveTransaction {
    pub timestamp: String,
    pub operation_type: String,
    pub original_image_hash: String,
    pub watermarked_image_hash: String,
    pub recovered_image_hash: String,
    pub extraction_ber: f64,
    pub original_watermark: String,
    pub extracted_watermark: String,
    pub removal_parameters: CodecParamsSummary,
}

/// The subset of [`CodecParams`] worth recording on a removal
/// transaction for audit purposes (kernel as a plain numeric grid,
/// matching `EmbedTransaction::kernel`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecParamsSummary {
    pub kernel: Vec<Vec<f64>>,
    pub stride: usize,
    pub t_hi: u32,
    pub bit_depth: u8,
}

/// Aggregate written for a batch embed run
/// (`examples/original_source/watermarking/watermark_embedder_batch.py`'s
/// `BatchProcessingResult`, generalized into a typed record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEmbedTransaction {
    pub timestamp: String,
    pub total_images: usize,
    pub processed_images: usize,
    pub failed_images: Vec<String>,
    pub processing_time_secs: f64,
    /// Keyed by `hash_image_wat`, as in the source; iterates in
    /// insertion order (see [`TransactionDict`]).
    pub transaction_dict: TransactionDict<EmbedTransaction>,
}

/// Aggregate written for a batch remove run
/// (`watermark_remover_batch.py`'s `BatchTransaction`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRemoveTransaction {
    pub timestamp: String,
    pub operation: String,
    pub batch_size: usize,
    pub successful_extractions: usize,
    pub failed_extractions: usize,
    pub average_ber: f64,
    /// Keyed by `watermarked_image_hash`, as in the source; iterates
    /// in insertion order (see [`TransactionDict`]).
    pub transaction_dict: TransactionDict<RemoveTransaction>,
}

/// Sum type over everything the ledger can append as a transaction
/// payload. Serializes with an internal `kind` tag so the JSON shape
/// stays self-describing and the genesis block's empty payload has an
/// unambiguous representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TransactionPayload {
    Genesis,
    BatchEmbed(BatchEmbedTransaction),
    BatchRemove(BatchRemoveTransaction),
}
