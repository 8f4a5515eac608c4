//! Directory fan-out for embed and remove (`spec.md` §5).
//!
//! Grounded in `examples/original_source/watermarking/watermark_embedder_batch.py`
//! and `watermark_remover_batch.py`'s collect → process-each →
//! aggregate-and-append shape: a failed image is recorded in
//! `failed_images` and otherwise ignored, never allowed to abort the
//! rest of the batch or touch the ledger on its own. Parallel fan-out
//! uses `std::thread::scope` with a bounded worker count rather than
//! an async runtime — nothing else in this workspace needs one.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use wmchain_core::codec::Kernel;
use wmchain_core::config::{EmbedConfigBuilder, RemoveConfig};
use wmchain_core::error::{Error, Result};
use wmchain_core::image_io::SUPPORTED_EXTENSIONS;
use wmchain_core::ledger::{self, Ledger};
use wmchain_core::operations::{run_embed, run_remove};
use wmchain_core::transaction::{
    BatchEmbedTransaction, BatchRemoveTransaction, EmbedTransaction, RemoveTransaction, TransactionDict,
    TransactionPayload,
};

fn collect_supported_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::InputMissing(dir.display().to_string()));
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| Error::Other(format!("reading {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    if files.is_empty() {
        return Err(Error::InputMissing(format!("{} contains no supported images", dir.display())));
    }
    files.sort();
    Ok(files)
}

fn extension_of(path: &Path) -> String {
    path.extension().and_then(|ext| ext.to_str()).unwrap_or("").to_lowercase()
}

/// Parameters for a directory-wide embed run. One [`BatchEmbedTransaction`]
/// is appended to the ledger once the whole batch finishes.
pub struct BatchEmbedRequest {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub message: String,
    pub blockchain_path: PathBuf,
    pub secret_key: String,
    pub stride: usize,
    pub t_hi: u32,
    pub bit_depth: Option<u8>,
    pub workers: usize,
}

pub struct BatchSummary {
    pub processed: usize,
    pub failed: Vec<String>,
}

pub fn run_batch_embed(req: &BatchEmbedRequest) -> Result<BatchSummary> {
    let files = collect_supported_files(&req.input_dir)?;
    std::fs::create_dir_all(&req.output_dir)
        .map_err(|e| Error::Other(format!("creating {}: {e}", req.output_dir.display())))?;

    let started = Instant::now();
    let queue: Mutex<Vec<PathBuf>> = Mutex::new(files);
    let successes: Mutex<TransactionDict<EmbedTransaction>> = Mutex::new(TransactionDict::new());
    let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..req.workers.max(1) {
            scope.spawn(|| embed_worker(req, &queue, &successes, &failures));
        }
    });

    let transaction_dict = successes.into_inner().expect("embed worker poisoned the success lock");
    let failed_images = failures.into_inner().expect("embed worker poisoned the failure lock");
    let processed_images = transaction_dict.len();
    let total_images = processed_images + failed_images.len();

    tracing::info!(processed_images, failed = failed_images.len(), "batch embed finished");

    let batch = BatchEmbedTransaction {
        timestamp: now_rfc3339(),
        total_images,
        processed_images,
        failed_images: failed_images.clone(),
        processing_time_secs: started.elapsed().as_secs_f64(),
        transaction_dict,
    };

    ledger::append_locked(&req.blockchain_path, TransactionPayload::BatchEmbed(batch), "embedder")?;

    Ok(BatchSummary { processed: processed_images, failed: failed_images })
}

fn embed_worker(
    req: &BatchEmbedRequest,
    queue: &Mutex<Vec<PathBuf>>,
    successes: &Mutex<TransactionDict<EmbedTransaction>>,
    failures: &Mutex<Vec<String>>,
) {
    loop {
        let path = match queue.lock().expect("embed queue poisoned").pop() {
            Some(path) => path,
            None => return,
        };

        let data_type = extension_of(&path);
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("image");
        let output_path = req.output_dir.join(format!("watermarked_{name}"));

        let mut config = EmbedConfigBuilder::new(
            path.to_string_lossy(),
            output_path.to_string_lossy(),
            req.message.clone(),
            req.blockchain_path.to_string_lossy(),
            data_type,
        )
        .kernel(Kernel::four_neighbor_average())
        .stride(req.stride)
        .t_hi(req.t_hi)
        .secret_key(req.secret_key.clone())
        .finish();
        if let Some(bit_depth) = req.bit_depth {
            config.bit_depth = Some(bit_depth);
        }

        match run_embed(&config) {
            Ok(tx) => {
                tracing::info!(image = %path.display(), "embedded watermark");
                successes.lock().expect("embed success lock poisoned").insert(tx.hash_image_wat.clone(), tx);
            }
            Err(err) => {
                tracing::warn!(image = %path.display(), error = %err, "embed failed, skipping image");
                failures.lock().expect("embed failure lock poisoned").push(path.display().to_string());
            }
        }
    }
}

/// Parameters for a directory-wide remove run. Images without a
/// matching `hash_image_wat` in the ledger are recorded as failures,
/// not aborted — `spec.md` §7 scopes `NoMatchingTransaction` to the
/// single image, not the batch.
pub struct BatchRemoveRequest {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub blockchain_path: PathBuf,
}

pub fn run_batch_remove(req: &BatchRemoveRequest) -> Result<BatchSummary> {
    let files = collect_supported_files(&req.input_dir)?;
    std::fs::create_dir_all(&req.output_dir)
        .map_err(|e| Error::Other(format!("creating {}: {e}", req.output_dir.display())))?;

    let ledger = Ledger::open(&req.blockchain_path)?;
    let queue: Mutex<Vec<PathBuf>> = Mutex::new(files);
    let successes: Mutex<TransactionDict<RemoveTransaction>> = Mutex::new(TransactionDict::new());
    let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| remove_worker(req, &ledger, &queue, &successes, &failures));
        }
    });

    let transaction_dict = successes.into_inner().expect("remove worker poisoned the success lock");
    let failed_images = failures.into_inner().expect("remove worker poisoned the failure lock");
    let successful_extractions = transaction_dict.len();
    let average_ber = if successful_extractions == 0 {
        0.0
    } else {
        transaction_dict.values().map(|tx| tx.extraction_ber).sum::<f64>() / successful_extractions as f64
    };

    tracing::info!(successful_extractions, failed = failed_images.len(), "batch remove finished");

    let batch = BatchRemoveTransaction {
        timestamp: now_rfc3339(),
        operation: "removal".to_string(),
        batch_size: successful_extractions + failed_images.len(),
        successful_extractions,
        failed_extractions: failed_images.len(),
        average_ber,
        transaction_dict,
    };

    ledger::append_locked(&req.blockchain_path, TransactionPayload::BatchRemove(batch), "remover")?;

    Ok(BatchSummary { processed: successful_extractions, failed: failed_images })
}

fn remove_worker(
    req: &BatchRemoveRequest,
    ledger: &Ledger,
    queue: &Mutex<Vec<PathBuf>>,
    successes: &Mutex<TransactionDict<RemoveTransaction>>,
    failures: &Mutex<Vec<String>>,
) {
    loop {
        let path = match queue.lock().expect("remove queue poisoned").pop() {
            Some(path) => path,
            None => return,
        };

        let data_type = extension_of(&path);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("image");
        let save_path = req.output_dir.join(format!("recovered_{name}"));
        let ext_wat_path = req.output_dir.join(format!("{stem}_extracted_watermark.json"));

        let config = RemoveConfig::new(
            path.to_string_lossy(),
            save_path.to_string_lossy(),
            ext_wat_path.to_string_lossy(),
            req.blockchain_path.to_string_lossy(),
            data_type,
        );

        match run_remove(ledger, &config) {
            Ok(outcome) => {
                tracing::info!(
                    image = %path.display(),
                    ber = outcome.transaction.extraction_ber,
                    "removed watermark"
                );
                successes
                    .lock()
                    .expect("remove success lock poisoned")
                    .insert(outcome.transaction.watermarked_image_hash.clone(), outcome.transaction);
            }
            Err(err) => {
                tracing::warn!(image = %path.display(), error = %err, "remove failed, skipping image");
                failures.lock().expect("remove failure lock poisoned").push(path.display().to_string());
            }
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
