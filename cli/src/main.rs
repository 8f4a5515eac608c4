mod batch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use wmchain_core::codec::Kernel;
use wmchain_core::config::{EmbedConfigBuilder, ExtractConfig, RemoveConfig};
use wmchain_core::ledger::{self, Ledger};
use wmchain_core::operations::{run_embed, run_extract, run_remove};
use wmchain_core::transaction::{BatchEmbedTransaction, BatchRemoveTransaction, TransactionPayload};

#[derive(Parser)]
#[command(name = "wmchain")]
#[command(about = "Reversible image watermarking with a hash-linked provenance ledger", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed a message into a single image and seal the result into the ledger.
    Embed {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        message: String,
        #[arg(long)]
        chain: PathBuf,
        /// One of: jpg, jpeg, png, bmp, tiff, dcm.
        #[arg(long)]
        data_type: String,
        #[arg(long, default_value_t = 3)]
        stride: usize,
        #[arg(long, default_value_t = 0)]
        t_hi: u32,
        #[arg(long)]
        bit_depth: Option<u8>,
        #[arg(long)]
        secret_key: Option<String>,
    },
    /// Determine an image's provenance: direct ledger hit or resolver verdict.
    Extract {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        chain: PathBuf,
        #[arg(long)]
        data_type: String,
    },
    /// Invert a prior embed and recover the original image losslessly.
    Remove {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        extracted_watermark: PathBuf,
        #[arg(long)]
        chain: PathBuf,
        #[arg(long)]
        data_type: String,
    },
    /// Embed a message into every supported image in a directory.
    BatchEmbed {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long)]
        message: String,
        #[arg(long)]
        chain: PathBuf,
        #[arg(long, default_value_t = 3)]
        stride: usize,
        #[arg(long, default_value_t = 0)]
        t_hi: u32,
        #[arg(long)]
        bit_depth: Option<u8>,
        #[arg(long)]
        secret_key: Option<String>,
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Invert a prior embed for every supported image in a directory.
    BatchRemove {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long)]
        chain: PathBuf,
    },
}

fn default_secret_key() -> String {
    "wmchain-default-key".to_string()
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Embed { input, output, message, chain, data_type, stride, t_hi, bit_depth, secret_key } => {
            embed_one(input, output, message, chain, data_type, stride, t_hi, bit_depth, secret_key)
        }
        Commands::Extract { input, chain, data_type } => extract_one(input, chain, data_type),
        Commands::Remove { input, output, extracted_watermark, chain, data_type } => {
            remove_one(input, output, extracted_watermark, chain, data_type)
        }
        Commands::BatchEmbed {
            input_dir,
            output_dir,
            message,
            chain,
            stride,
            t_hi,
            bit_depth,
            secret_key,
            workers,
        } => {
            let request = batch::BatchEmbedRequest {
                input_dir,
                output_dir,
                message,
                blockchain_path: chain,
                secret_key: secret_key.unwrap_or_else(default_secret_key),
                stride,
                t_hi,
                bit_depth,
                workers,
            };
            batch::run_batch_embed(&request).map(|summary| {
                println!("embedded {} image(s), {} failed", summary.processed, summary.failed.len());
                for failed in &summary.failed {
                    println!("  failed: {failed}");
                }
            })
        }
        Commands::BatchRemove { input_dir, output_dir, chain } => {
            let request = batch::BatchRemoveRequest { input_dir, output_dir, blockchain_path: chain };
            batch::run_batch_remove(&request).map(|summary| {
                println!("recovered {} image(s), {} failed", summary.processed, summary.failed.len());
                for failed in &summary.failed {
                    println!("  failed: {failed}");
                }
            })
        }
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn embed_one(
    input: PathBuf,
    output: PathBuf,
    message: String,
    chain: PathBuf,
    data_type: String,
    stride: usize,
    t_hi: u32,
    bit_depth: Option<u8>,
    secret_key: Option<String>,
) -> wmchain_core::Result<()> {
    let mut config = EmbedConfigBuilder::new(
        input.to_string_lossy(),
        output.to_string_lossy(),
        message,
        chain.to_string_lossy(),
        data_type,
    )
    .kernel(Kernel::four_neighbor_average())
    .stride(stride)
    .t_hi(t_hi)
    .secret_key(secret_key.unwrap_or_else(default_secret_key))
    .finish();
    if let Some(bit_depth) = bit_depth {
        config.bit_depth = Some(bit_depth);
    }

    let tx = run_embed(&config)?;

    let mut transaction_dict = wmchain_core::transaction::TransactionDict::new();
    transaction_dict.insert(tx.hash_image_wat.clone(), tx);
    let batch = BatchEmbedTransaction {
        timestamp: chrono::Utc::now().to_rfc3339(),
        total_images: 1,
        processed_images: 1,
        failed_images: vec![],
        processing_time_secs: 0.0,
        transaction_dict,
    };
    ledger::append_locked(&config.blockchain_path, TransactionPayload::BatchEmbed(batch), "embedder")?;

    println!("embedded watermark, sealed into {}", config.blockchain_path);
    Ok(())
}

fn extract_one(input: PathBuf, chain: PathBuf, data_type: String) -> wmchain_core::Result<()> {
    let ledger = Ledger::open(&chain)?;
    let config = ExtractConfig::new(input.to_string_lossy(), chain.to_string_lossy(), data_type);
    let history = run_extract(&ledger, &config)?;
    println!("{}", serde_json::to_string_pretty(&history).expect("HistoryRecord always serializes"));
    Ok(())
}

fn remove_one(
    input: PathBuf,
    output: PathBuf,
    extracted_watermark: PathBuf,
    chain: PathBuf,
    data_type: String,
) -> wmchain_core::Result<()> {
    let ledger = Ledger::open(&chain)?;
    let config = RemoveConfig::new(
        input.to_string_lossy(),
        output.to_string_lossy(),
        extracted_watermark.to_string_lossy(),
        chain.to_string_lossy(),
        data_type,
    );
    let outcome = run_remove(&ledger, &config)?;

    let mut transaction_dict = wmchain_core::transaction::TransactionDict::new();
    transaction_dict.insert(outcome.transaction.watermarked_image_hash.clone(), outcome.transaction.clone());
    let batch = BatchRemoveTransaction {
        timestamp: chrono::Utc::now().to_rfc3339(),
        operation: "removal".to_string(),
        batch_size: 1,
        successful_extractions: 1,
        failed_extractions: 0,
        average_ber: outcome.transaction.extraction_ber,
        transaction_dict,
    };
    ledger::append_locked(&config.blockchain_path, TransactionPayload::BatchRemove(batch), "remover")?;

    println!("recovered original image, ber={:.4}", outcome.transaction.extraction_ber);
    Ok(())
}
