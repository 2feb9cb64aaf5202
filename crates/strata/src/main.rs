//! Inspect persisted engine checkpoints and configuration files.
//!
//! # Examples
//!
//! ```sh
//! # Stats for a saved checkpoint
//! strata inspect run/checkpoint-0004.json
//!
//! # Also pack a 32k window (with 2k reserved for output) and list it
//! strata inspect run/checkpoint-0004.json --pack 32000 --reserve 2000
//!
//! # JSON Schema of the engine configuration
//! strata schema > strata-config.schema.json
//!
//! # Validate a config file
//! strata check-config strata.json
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use strata::checkpoint::CheckpointStore;
use strata::config::EngineConfig;
use strata::engine::ContextEngine;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Inspect persisted engine checkpoints and configuration files.
#[derive(Parser)]
#[command(name = "strata")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print stats (and optionally a packed window) for a checkpoint file
    Inspect {
        /// Checkpoint JSON written by `CheckpointStore`
        file: PathBuf,

        /// Engine config to rebuild with (defaults otherwise)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Pack a window of this many tokens and list its items
        #[arg(long)]
        pack: Option<usize>,

        /// Output reservation subtracted from --pack
        #[arg(long, default_value_t = 0)]
        reserve: usize,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print the JSON Schema of the engine configuration
    Schema,
    /// Validate a configuration file
    CheckConfig {
        file: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .take(max_chars)
        .collect();
    if text.chars().count() > max_chars {
        format!("{flat}...")
    } else {
        flat
    }
}

fn inspect(
    file: &Path,
    config: Option<&Path>,
    pack: Option<usize>,
    reserve: usize,
    json: bool,
) -> Result<String, String> {
    let config = match config {
        Some(path) => EngineConfig::from_json_file(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    let checkpoint = CheckpointStore::load(file)
        .map_err(|e| format!("failed to load '{}': {e}", file.display()))?;
    let taken_at = checkpoint.taken_at.clone();
    let id = checkpoint.id;
    let mut engine = ContextEngine::from_checkpoint(config, checkpoint).map_err(|e| e.to_string())?;
    engine.verify().map_err(|e| e.to_string())?;

    let window = pack.map(|budget| engine.pack(budget, reserve));
    let stats = engine.stats();

    if json {
        let value = serde_json::json!({
            "checkpoint": id,
            "taken_at": taken_at,
            "stats": stats,
            "window": window,
        });
        return serde_json::to_string_pretty(&value).map_err(|e| e.to_string());
    }

    let mut out = format!("{id} taken {taken_at}\n{}\n", stats.to_log_string());
    let state = engine.task_state().render();
    if !state.is_empty() {
        out.push('\n');
        out.push_str(&state);
    }
    if let Some(window) = window {
        out.push_str(&format!("\n{}\n", window.to_log_string()));
        for item in &window.items {
            let id = item.id.map_or_else(|| "task-state".to_string(), |id| id.to_string());
            out.push_str(&format!(
                "  {:<7} {:<10} {:>6}t{} {}\n",
                format!("{:?}", item.section).to_lowercase(),
                id,
                item.tokens,
                if item.truncated { "*" } else { " " },
                preview(&item.content, 80),
            ));
        }
        for w in &window.warnings {
            out.push_str(&format!("  warning: {w}\n"));
        }
        for pair in &window.broken_pairs {
            out.push_str(&format!(
                "  broken pair: {} left out, partner {} kept (strength {:.2})\n",
                pair.missing, pair.present_partner, pair.strength
            ));
        }
    }
    Ok(out)
}

fn run(cli: &Cli) -> Result<String, String> {
    match &cli.command {
        Command::Inspect {
            file,
            config,
            pack,
            reserve,
            json,
        } => inspect(file, config.as_deref(), *pack, *reserve, *json),
        Command::Schema => {
            let schema = schemars::schema_for!(EngineConfig);
            serde_json::to_string_pretty(&schema).map_err(|e| e.to_string())
        }
        Command::CheckConfig { file } => {
            let config = EngineConfig::from_json_file(file).map_err(|e| e.to_string())?;
            Ok(format!(
                "ok: window budget {} tokens, {} reserved for output",
                config.window_budget(),
                config.output_reservation
            ))
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    match run(&cli) {
        Ok(output) => println!("{}", output.trim_end()),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
