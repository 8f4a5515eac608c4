//! Single-image embed/extract/remove operations.
//!
//! These tie components A–G together into the three external
//! operations `spec.md` §6 names. Batch fan-out over a directory of
//! images is explicitly an external collaborator (`spec.md` §1) and
//! lives in the `wmchain-cli` crate, which calls these per-image and
//! aggregates the results into one ledger append.

use chrono::Utc;

use crate::codec::{embed as codec_embed, extract as codec_extract, CodecParams};
use crate::config::{EmbedConfig, ExtractConfig, RemoveConfig};
use crate::error::{Error, Result};
use crate::hashing::{bit_error_rate, content_hash, hex_to_bits};
use crate::image_io::{self, ImageMatrix};
use crate::ledger::{HistoryRecord, Ledger};
use crate::resolver::resolve_provenance;
use crate::transaction::{CodecParamsSummary, EmbedTransaction, RemoveTransaction};
use sha2::{Digest, Sha256};

/// Embeds `config.message`'s SHA-256 digest into the image at
/// `config.data_path`, writes the watermarked image to
/// `config.save_path`, and returns the transaction record describing
/// the operation. Does not touch the ledger; callers append the
/// returned transaction (wrapped in a batch, even a batch of one) via
/// [`crate::ledger::Ledger::add_transaction`].
pub fn run_embed(config: &EmbedConfig) -> Result<EmbedTransaction> {
    let path = std::path::Path::new(&config.data_path);
    let loaded = image_io::load_grayscale(path, &config.data_type)?;
    let image = loaded.matrix;

    let bit_depth = config.bit_depth.unwrap_or(image.bit_depth);
    let params = CodecParams { kernel: config.kernel.clone(), stride: config.stride, t_hi: config.t_hi, bit_depth };

    let watermark_hex = hex::encode(Sha256::digest(config.message.as_bytes()));
    let watermark_bits = hex_to_bits(&watermark_hex);

    let outcome = codec_embed(&image, &params, &config.secret_key, &watermark_bits)?;

    let save_path = std::path::Path::new(&config.save_path);
    image_io::save_grayscale(save_path, &outcome.watermarked, &loaded.container)?;

    Ok(EmbedTransaction {
        timestamp: Utc::now().to_rfc3339(),
        data_type: config.data_type.clone(),
        hash_image_orig: content_hash(&image),
        hash_image_wat: content_hash(&outcome.watermarked),
        secret_key: config.secret_key.clone(),
        message: config.message.clone(),
        watermark: watermark_hex,
        kernel: params.kernel.weights.clone(),
        stride: params.stride,
        t_hi: params.t_hi,
        bit_depth: params.bit_depth,
        overflow_positions: outcome.overflow_positions,
        info: "embedder".to_string(),
    })
}

/// Determines the provenance of the image at `config.data_path`: a
/// direct ledger hit if its hash matches a prior embed, otherwise the
/// resolver's verdict.
pub fn run_extract(ledger: &Ledger, config: &ExtractConfig) -> Result<HistoryRecord> {
    let path = std::path::Path::new(&config.data_path);
    let loaded = image_io::load_grayscale(path, &config.data_type)?;
    let image_hash = content_hash(&loaded.matrix);

    let (history, _transaction) = ledger.get_transaction_history(&image_hash);
    if let Some(mut history) = history {
        history.ber = 0.0;
        return Ok(history);
    }

    Ok(resolve_provenance(ledger, &loaded.matrix, &config.data_type))
}

/// Result of a successful remove operation.
pub struct RemoveOutcome {
    pub recovered: ImageMatrix,
    pub extracted_watermark_bits: [u8; 256],
    pub transaction: RemoveTransaction,
}

/// Inverts a prior embed: looks the watermarked image up in the
/// ledger, recovers the original pixels, writes them to
/// `config.save_path`, writes the 256-bit extracted watermark to
/// `config.ext_wat_path`, and returns the removal transaction record.
///
/// Returns [`Error::NoMatchingTransaction`] if the image's hash is not
/// a recorded `hash_image_wat` — fatal for this image only, per
/// `spec.md` §7.
pub fn run_remove(ledger: &Ledger, config: &RemoveConfig) -> Result<RemoveOutcome> {
    let path = std::path::Path::new(&config.data_path);
    let loaded = image_io::load_grayscale(path, &config.data_type)?;
    let image_hash = content_hash(&loaded.matrix);

    let (_, transaction) = ledger.get_transaction_history(&image_hash);
    let transaction = transaction.ok_or(Error::NoMatchingTransaction)?;

    let params = transaction.codec_params();
    let outcome =
        codec_extract(&loaded.matrix, &params, &transaction.secret_key, &transaction.overflow_positions)?;

    let recovered_hash = content_hash(&outcome.recovered);
    if recovered_hash != transaction.hash_image_orig {
        return Err(Error::CodecAssertionFailed);
    }

    let save_path = std::path::Path::new(&config.save_path);
    image_io::save_grayscale(save_path, &outcome.recovered, &loaded.container)?;
    write_watermark_file(&config.ext_wat_path, &outcome.aggregated_256)?;

    let original_watermark = hex_to_bits(&transaction.watermark);
    let ber = bit_error_rate(&outcome.aggregated_256, &original_watermark);
    let extracted_watermark_hex = crate::hashing::bits_to_hex(&outcome.aggregated_256);

    let removal_transaction = RemoveTransaction {
        timestamp: Utc::now().to_rfc3339(),
        operation_type: "removal".to_string(),
        original_image_hash: transaction.hash_image_orig.clone(),
        watermarked_image_hash: image_hash,
        recovered_image_hash: recovered_hash,
        extraction_ber: ber,
        original_watermark: transaction.watermark.clone(),
        extracted_watermark: extracted_watermark_hex,
        removal_parameters: CodecParamsSummary {
            kernel: transaction.kernel.clone(),
            stride: transaction.stride,
            t_hi: transaction.t_hi,
            bit_depth: transaction.bit_depth,
        },
    };

    Ok(RemoveOutcome {
        recovered: outcome.recovered,
        extracted_watermark_bits: outcome.aggregated_256,
        transaction: removal_transaction,
    })
}

fn write_watermark_file(path: &str, bits: &[u8; 256]) -> Result<()> {
    let as_json = serde_json::to_vec(&bits.to_vec())
        .map_err(|e| Error::Other(format!("serializing extracted watermark: {e}")))?;
    std::fs::write(path, as_json).map_err(|e| Error::Other(format!("writing {path}: {e}")))
}
