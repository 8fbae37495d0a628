use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use parrot::cache::{CachePolicy, KeyParams};
use parrot::config::Config;
use parrot::repository::{GetOptions, WriteOptions};
use parrot::tts::HttpGenerator;
use parrot::{logging, Context};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Parser, Debug)]
#[command(name = "parrot")]
#[command(about = "Offline-tolerant cache and sync engine for generated speech")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/parrot/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep every store in memory for this run
  #[arg(long)]
  memory: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show audio cache size and backend
  Stats,
  /// Remove every cached record
  Clear,
  /// Remove audio older than the given number of days
  Prune {
    #[arg(long, default_value_t = 30)]
    older_than_days: i64,
  },
  /// Generate speech through the cache
  Speak {
    #[arg(long)]
    text: String,
    #[arg(long, default_value = "neutral")]
    voice: String,
    #[arg(long, default_value = "en-US")]
    lang: String,
    /// Write the audio here
    #[arg(long)]
    out: Option<PathBuf>,
  },
  /// Probe connectivity and show network and sync state
  Status,
  /// Read a cached entry
  Get {
    key: String,
    #[arg(long)]
    policy: Option<CachePolicy>,
  },
  /// Write an entry (value is JSON)
  Set {
    key: String,
    value: String,
    /// Do not queue the write for the remote
    #[arg(long)]
    no_sync: bool,
  },
  /// Delete an entry
  Delete { key: String },
  /// List entries whose keys match a `*` pattern
  Query { pattern: String },
  /// Show cache hit/miss counters for this run
  Metrics,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Held for the whole run so buffered log lines reach the file
  let _log_guard = logging::init(logging::default_log_dir())?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if args.memory {
    config.cache.force_memory = true;
  }

  let ctx = Context::from_config(config)?;
  ctx.start();
  let result = run(&ctx, args.command).await;
  ctx.shutdown();
  result
}

async fn run(ctx: &Context, command: Command) -> Result<()> {
  match command {
    Command::Stats => {
      let stats = ctx.tts.stats()?;
      println!("backend: {}", ctx.audio_store.backend());
      println!("records: {}", stats.count);
      println!("bytes:   {} / {}", stats.total_bytes, ctx.config.cache.max_bytes);
    }

    Command::Clear => {
      ctx.tts.clear_all()?;
      ctx.cache.clear()?;
      println!("cache cleared");
    }

    Command::Prune { older_than_days } => {
      let cutoff = Utc::now().timestamp_millis() - older_than_days * DAY_MS;
      let removed = ctx.tts.clear_expired(cutoff)?;
      println!("removed {removed} record(s)");
    }

    Command::Speak {
      text,
      voice,
      lang,
      out,
    } => {
      let generator_config = &ctx.config.generator;
      let url = generator_config
        .url
        .as_deref()
        .ok_or_else(|| eyre!("No generator url configured. Set generator.url in the config file."))?;
      let generator = HttpGenerator::new(
        url,
        Config::get_generator_token(),
        Duration::from_millis(generator_config.timeout_ms),
      )?;

      let mut params = KeyParams::new(text, voice, lang);
      params.provider = generator_config.provider.clone();
      params.version = generator_config.version.clone();

      let result = ctx
        .tts
        .get_or_generate(&params, || generator.generate(&params))
        .await?;

      if let Some(path) = out {
        std::fs::write(&path, &result.payload)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      }
      print_json(&serde_json::json!({
        "source": result.source,
        "meta": result.meta,
      }))?;
    }

    Command::Status => {
      ctx.network.check_network_status().await;
      print_json(&ctx.repository.get_stats()?)?;
    }

    Command::Get { key, policy } => {
      let options = GetOptions::<Value> {
        policy,
        ..Default::default()
      };
      match ctx.repository.get(&key, options).await? {
        Some(hit) => print_json(&serde_json::json!({
          "value": hit.value,
          "metadata": hit.metadata,
          "source": hit.source,
        }))?,
        None => println!("not found"),
      }
    }

    Command::Set { key, value, no_sync } => {
      let value: Value = serde_json::from_str(&value).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
      let options = WriteOptions {
        sync: !no_sync,
        ..Default::default()
      };
      let result = ctx.repository.set(&key, &value, options).await?;
      print_json(&result)?;
    }

    Command::Delete { key } => {
      let result = ctx.repository.delete(&key, WriteOptions::default()).await?;
      print_json(&result)?;
    }

    Command::Query { pattern } => {
      let entries = ctx.repository.query::<Value>(&pattern)?;
      let listing: serde_json::Map<String, Value> = entries.into_iter().map(|(key, hit)| (key, hit.value)).collect();
      print_json(&listing)?;
    }

    Command::Metrics => {
      print_json(&ctx.observability.snapshot())?;
    }
  }

  Ok(())
}
