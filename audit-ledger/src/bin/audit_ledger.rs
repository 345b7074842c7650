//! Audit ledger command-line tool

use anyhow::{anyhow, Context, Result};
use audit_ledger::{
    storage::{export_entries, import_entries},
    verify::VerificationReport,
    AppendOptions, BatchProcessor, Config, Ed25519Signer, EntryFilter, Ledger, MemoryBackend,
    Payload, Signer,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "audit-ledger", version, about = "Hash-chained audit ledger")]
struct Cli {
    /// TOML configuration file (defaults to AUDIT_LEDGER_* environment variables)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append sample entries to an in-memory ledger, verify, print stats
    Demo {
        /// Transfers to append after the login entry
        #[arg(long, default_value_t = 5)]
        transfers: usize,
        /// Also write the demo chain here (JSON lines)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Verify an exported chain (JSON lines); exits 1 on tampering
    Verify {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
    },
    /// Print statistics of an exported chain
    Stats {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
    },
    /// Re-export a chain after checking it; writes to stdout without --output
    Export {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Jsonl)]
        format: ExportFormat,
    },
    /// Print the Merkle inclusion proof of one entry
    MerkleProof {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
        /// Position of the entry in the chain
        #[arg(long)]
        index: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    /// One entry per line; readable by --input
    Jsonl,
    /// Pretty-printed JSON array
    Json,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env()?,
    };
    // One-shot commands never need the background verifier
    config.auto_verify = false;

    match cli.command {
        Command::Demo { transfers, output } => run_demo(config, transfers, output.as_deref()),
        Command::Verify { input } => {
            let ledger = load_ledger(&input, config)?;
            match ledger.verify_integrity(None, None) {
                Ok(report) => {
                    println!("{}", verified_message(&report));
                    Ok(())
                }
                Err(e) if e.is_integrity() => {
                    eprintln!("FAILED: {}", e);
                    std::process::exit(1);
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Stats { input } => {
            let ledger = load_ledger(&input, config)?;
            println!("{}", serde_json::to_string_pretty(&ledger.get_stats()?)?);
            Ok(())
        }
        Command::Export {
            input,
            output,
            format,
        } => {
            let ledger = load_ledger(&input, config)?;
            ledger.verify_integrity(None, None)?;
            match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    let written = write_export(&ledger, format, BufWriter::new(file))?;
                    println!("Exported {} entries to {}", written, path.display());
                }
                None => {
                    write_export(&ledger, format, io::stdout().lock())?;
                }
            }
            Ok(())
        }
        Command::MerkleProof { input, index } => {
            let ledger = load_ledger(&input, config)?;
            let tree = ledger.merkle_tree(&EntryFilter::all())?;
            let proof = tree
                .generate_proof_at(index)
                .ok_or_else(|| anyhow!("index {} out of range (chain has {} entries)", index, tree.len()))?;
            println!("{}", serde_json::to_string_pretty(&proof)?);
            Ok(())
        }
    }
}

fn load_ledger(input: &Path, config: Config) -> Result<Ledger> {
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let entries = import_entries(BufReader::new(file))?;
    tracing::info!(entries = entries.len(), path = %input.display(), "Chain imported");

    let backend = MemoryBackend::from_entries(entries)?;
    Ok(Ledger::new(Arc::new(backend), config)?)
}

fn verified_message(report: &VerificationReport) -> String {
    format!(
        "OK: chain verified, {} entries, head {}",
        report.entries_checked,
        report
            .head_hash
            .as_ref()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "(empty)".to_string())
    )
}

fn write_export<W: Write>(ledger: &Ledger, format: ExportFormat, mut writer: W) -> Result<usize> {
    let written = match format {
        ExportFormat::Jsonl => export_entries(ledger.backend().as_ref(), &mut writer)?,
        ExportFormat::Json => {
            let entries = ledger.get_entries(&EntryFilter::all())?;
            serde_json::to_writer_pretty(&mut writer, &entries)?;
            writeln!(writer)?;
            entries.len()
        }
    };
    writer.flush()?;
    Ok(written)
}

fn object(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn run_demo(config: Config, transfers: usize, output: Option<&Path>) -> Result<()> {
    let batch_config = config.batch.clone();
    let signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::generate());
    let ledger = Arc::new(Ledger::with_signer(
        Arc::new(MemoryBackend::new()),
        config,
        signer.clone(),
    )?);

    ledger.subscribe(|entry| {
        tracing::info!(sequence = entry.sequence, hash = %entry.hash, "New entry");
        Ok(())
    });

    let login = ledger.append_with(
        object(json!({ "event": "login", "user": "alice" })),
        AppendOptions::default().signed_by(signer.clone()),
    )?;
    ledger.verify_signature(&login, signer.as_ref())?;

    let processor = BatchProcessor::with_metrics(
        ledger.clone(),
        batch_config,
        ledger.metrics().clone(),
    )?;
    for i in 0..transfers {
        processor.add_data(object(json!({ "event": "transfer", "amount": 100 * (i + 1) })))?;
    }
    if let Some(result) = processor.stop()? {
        println!(
            "Batch: {}/{} appended in {:?}",
            result.success_count(),
            result.total_operations,
            result.execution_time
        );
    }

    let report = ledger.verify_integrity(None, None)?;
    println!("{}", verified_message(&report));

    let tree = ledger.merkle_tree(&EntryFilter::all())?;
    println!("Merkle root: {}", tree.root());

    println!("{}", serde_json::to_string_pretty(&ledger.get_stats()?)?);

    if let Some(path) = output {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let written = write_export(&ledger, ExportFormat::Jsonl, BufWriter::new(file))?;
        println!("Exported {} entries to {}", written, path.display());
    }

    ledger.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            auto_verify: false,
            ..Config::default()
        }
    }

    fn sample_ledger(n: usize) -> Ledger {
        let ledger = Ledger::in_memory(test_config()).unwrap();
        for i in 0..n {
            ledger.append(object(json!({ "event": "transfer", "i": i }))).unwrap();
        }
        ledger
    }

    #[test]
    fn test_jsonl_export_loads_back() {
        let ledger = sample_ledger(3);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(write_export(&ledger, ExportFormat::Jsonl, file.as_file_mut()).unwrap(), 3);

        let reloaded = load_ledger(file.path(), test_config()).unwrap();
        assert_eq!(reloaded.verify_integrity(None, None).unwrap().entries_checked, 3);
        assert_eq!(reloaded.head_hash().unwrap(), ledger.head_hash().unwrap());
    }

    #[test]
    fn test_json_export_is_array() {
        let ledger = sample_ledger(2);
        let mut out = Vec::new();
        assert_eq!(write_export(&ledger, ExportFormat::Json, &mut out).unwrap(), 2);

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["data"]["i"], json!(1));
    }

    #[test]
    fn test_verified_message_plain_ascii() {
        let ledger = sample_ledger(2);
        let message = verified_message(&ledger.verify_integrity(None, None).unwrap());
        assert!(message.is_ascii());
        assert!(message.starts_with("OK: chain verified, 2 entries"));

        let empty = sample_ledger(0);
        let message = verified_message(&empty.verify_integrity(None, None).unwrap());
        assert!(message.ends_with("head (empty)"));
    }

    #[test]
    fn test_export_command_parses() {
        let cli = Cli::parse_from([
            "audit-ledger", "export", "--input", "in.jsonl", "-o", "out.json", "-f", "json",
        ]);
        match cli.command {
            Command::Export { output, format, .. } => {
                assert_eq!(output, Some(PathBuf::from("out.json")));
                assert_eq!(format, ExportFormat::Json);
            }
            _ => panic!("expected export"),
        }
    }
}
