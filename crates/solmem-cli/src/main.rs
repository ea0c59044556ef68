//! `solmem` – the workflow driver for the rover memory pipeline.
//!
//! Loads `~/.solmem/config.toml`, wires the collaborator clients once, and
//! runs either a whole tick (Schedule → Fetch → Generate → Embed) or a single
//! stage from a JSON payload. Ctrl-C cancels an in-flight tick; stages that
//! already finished keep their pipeline log entries.

mod config;

use std::io::{IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tracing::{debug, info, warn};

use solmem_memory::clock::SimulationClock;
use solmem_memory::content_store::FsContentStore;
use solmem_memory::pipeline_log::PipelineLog;
use solmem_memory::vector_index::VectorIndex;
use solmem_runtime::{
    Collaborators, HttpLabelDetector, LlmDriver, NasaImagery, Pipeline, TickReport, init_tracing,
};
use solmem_types::{
    DRY_RUN_SIMULATION_ID, EarthDate, PipelineError, SolConverter, StageId, StageStatus,
};

use config::Config;

// ─────────────────────────────────────────────────────────────────────────────
// Command line
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "solmem", version, about = "Daily memory pipeline for a planetary rover")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run Schedule → Fetch → Generate → Embed once.
    Tick {
        #[arg(long, default_value = DRY_RUN_SIMULATION_ID)]
        simulation_id: String,
    },
    /// Run one stage with a JSON payload (from --payload or stdin).
    Stage {
        stage: StageId,
        #[arg(long)]
        payload: Option<String>,
    },
    /// Print the pipeline log row for a date.
    Log { earth_date: EarthDate },
    /// Print the current date of a simulation, seeding it if new.
    Clock { simulation_id: String },
    /// Convert an earth date (default: today, UTC) to a sol.
    Sol { earth_date: Option<EarthDate> },
    /// Semantic search over indexed memories.
    Recall {
        text: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Write a default config file.
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    // Tracing comes up before the Tokio runtime; the OTLP exporter is
    // synchronous for that reason.
    let _guard = init_tracing("solmem");
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: failed to start async runtime: {e}", "error".red().bold());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<ExitCode, String> {
    if let Command::Init { force } = command {
        return init(force);
    }

    let cfg = config::load()?;
    debug!(config = ?cfg, "configuration loaded");

    match command {
        Command::Tick { simulation_id } => tick(&cfg, &simulation_id).await,
        Command::Stage { stage, payload } => run_stage(&cfg, stage, payload).await,
        Command::Log { earth_date } => show_log(&cfg, earth_date),
        Command::Clock { simulation_id } => show_clock(&cfg, &simulation_id),
        Command::Sol { earth_date } => show_sol(&cfg, earth_date),
        Command::Recall { text, top_k } => recall(&cfg, &text, top_k).await,
        Command::Init { .. } => Ok(ExitCode::SUCCESS),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

fn database_path(cfg: &Config) -> Result<String, String> {
    if let Some(parent) = cfg.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
    }
    Ok(cfg.database_path.to_string_lossy().into_owned())
}

fn llm_driver(cfg: &Config) -> LlmDriver {
    LlmDriver::new(&cfg.llm_base_url, &cfg.text_model)
        .with_embedding_model(&cfg.embedding_model)
        .with_api_key(Some(cfg.llm_api_key.clone()))
}

/// Construct every collaborator once and hand them to the orchestrator.
fn build_pipeline(cfg: &Config) -> Result<Pipeline, String> {
    cfg.validate().map_err(|e| e.to_string())?;
    let db = database_path(cfg)?;

    let clock = Arc::new(SimulationClock::open(&db).map_err(|e| e.to_string())?);
    let log = Arc::new(PipelineLog::open(&db).map_err(|e| e.to_string())?);
    let index = Arc::new(VectorIndex::open(&db).map_err(|e| e.to_string())?);
    let content = Arc::new(FsContentStore::open(&cfg.content_root).map_err(|e| e.to_string())?);
    let llm = Arc::new(llm_driver(cfg));
    let imagery = NasaImagery::new(&cfg.imagery_base_url, &cfg.imagery_api_key)
        .with_rover(&cfg.rover)
        .with_camera(&cfg.camera)
        .with_rate_limit(cfg.imagery_requests_per_second);

    let collaborators = Collaborators {
        imagery: Arc::new(imagery),
        labels: Arc::new(HttpLabelDetector::new(&cfg.label_endpoint)),
        text: llm.clone(),
        embedder: llm,
        content,
        index,
    };
    info!(database = %db, content_root = %cfg.content_root.display(), "pipeline wired");
    Pipeline::new(clock, log, collaborators, cfg.pipeline_settings()).map_err(|e| e.to_string())
}

fn describe(err: &PipelineError) -> String {
    if err.is_retryable() {
        format!("{err} (retryable)")
    } else {
        format!("{err} (not retryable)")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

async fn tick(cfg: &Config, simulation_id: &str) -> Result<ExitCode, String> {
    let pipeline = build_pipeline(cfg)?;

    tokio::select! {
        result = pipeline.run_tick(simulation_id) => {
            let report = result.map_err(|e| describe(&e))?;
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(simulation_id, "tick cancelled by Ctrl-C");
            println!();
            println!("{}", "⚠  Ctrl-C received – tick cancelled.".yellow().bold());
            println!("  Stages that finished remain recorded in the pipeline log.");
            Ok(ExitCode::from(130))
        }
    }
}

fn print_report(report: &TickReport) {
    let s = &report.schedule;
    println!(
        "{} {} (sol {}) for simulation {}",
        "✓".green().bold(),
        s.earth_date.to_string().bold(),
        s.sol,
        s.simulation_id.cyan()
    );
    println!("  run id        {}", s.run_id.to_string().dimmed());
    println!("  next date     {}", s.next_earth_date);
    println!("  photos        {}", report.photos.len());
    println!(
        "  memories      {} ok, {} failed",
        report.memories.succeeded.len(),
        report.memories.failed.len()
    );
    println!(
        "  embedded      {} ok, {} failed",
        report.embedded.succeeded.len(),
        report.embedded.failed.len()
    );
    for failure in report.memories.failed.iter().chain(&report.embedded.failed) {
        println!("  {} photo {}: {}", "✗".red(), failure.photo_id, failure.error);
    }
}

fn read_payload(payload: Option<String>) -> Result<Value, String> {
    let raw = match payload {
        Some(raw) => raw,
        None if std::io::stdin().is_terminal() => String::new(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("Failed to read payload from stdin: {e}"))?;
            buf
        }
    };
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&raw).map_err(|e| format!("Payload is not JSON: {e}"))
}

async fn run_stage(cfg: &Config, stage: StageId, payload: Option<String>) -> Result<ExitCode, String> {
    let payload = read_payload(payload)?;
    let pipeline = build_pipeline(cfg)?;

    let response = tokio::select! {
        response = pipeline.handle(stage, payload) => response,
        _ = tokio::signal::ctrl_c() => {
            warn!(stage = %stage, "stage cancelled by Ctrl-C");
            return Ok(ExitCode::from(130));
        }
    };
    let rendered = serde_json::to_string_pretty(&response).map_err(|e| e.to_string())?;
    println!("{rendered}");
    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn show_log(cfg: &Config, earth_date: EarthDate) -> Result<ExitCode, String> {
    let log = PipelineLog::open(&database_path(cfg)?).map_err(|e| e.to_string())?;
    let entry = log.read(earth_date).map_err(|e| e.to_string())?;

    println!("{} {}", "Pipeline log".bold(), earth_date.to_string().cyan());
    if let Some(sol) = entry.sol {
        println!("  sol           {sol}");
    }
    for id in StageId::ALL {
        match entry.stage(id) {
            Some(record) => {
                let status = match record.status {
                    StageStatus::Success => record.status.as_str().green(),
                    StageStatus::Failed => record.status.as_str().red(),
                };
                println!("  {:<13} {} {}", id.key(), status, record.updated_at.to_rfc3339().dimmed());
                println!("                {}", record.output);
            }
            None => println!("  {:<13} {}", id.key(), "-".dimmed()),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn show_clock(cfg: &Config, simulation_id: &str) -> Result<ExitCode, String> {
    let clock = SimulationClock::open(&database_path(cfg)?).map_err(|e| e.to_string())?;
    let date = clock.get_or_seed(simulation_id).map_err(|e| e.to_string())?;
    let converter = SolConverter::new(cfg.pipeline.sol_length_in_days).map_err(|e| e.to_string())?;
    let sol = converter.earth_date_to_sol(date).map_err(|e| e.to_string())?;
    println!("{} {} (sol {sol})", simulation_id.cyan(), date.to_string().bold());
    if simulation_id == DRY_RUN_SIMULATION_ID {
        println!("  {}", "dry-run simulation: the clock never advances".dimmed());
    }
    Ok(ExitCode::SUCCESS)
}

fn show_sol(cfg: &Config, earth_date: Option<EarthDate>) -> Result<ExitCode, String> {
    let date = earth_date.unwrap_or_else(|| EarthDate::from_naive(chrono::Utc::now().date_naive()));
    let converter = SolConverter::new(cfg.pipeline.sol_length_in_days).map_err(|e| e.to_string())?;
    let sol = converter.earth_date_to_sol(date).map_err(|e| e.to_string())?;
    println!("{date} → sol {sol}");
    Ok(ExitCode::SUCCESS)
}

async fn recall(cfg: &Config, text: &str, top_k: usize) -> Result<ExitCode, String> {
    let index = VectorIndex::open(&database_path(cfg)?).map_err(|e| e.to_string())?;
    if index.is_empty().map_err(|e| e.to_string())? {
        println!("{}", "No memories indexed yet. Run `solmem tick` first.".dimmed());
        return Ok(ExitCode::SUCCESS);
    }
    let query = llm_driver(cfg).embedding(text).await.map_err(|e| e.to_string())?;
    let hits = index.recall_similar(&query, top_k).map_err(|e| e.to_string())?;

    for (record, score) in hits {
        let m = &record.metadata;
        println!(
            "{} {} {} {}",
            format!("{score:.3}").green(),
            m.date.to_string().bold(),
            record.memory_id.cyan(),
            m.content_ref.dimmed()
        );
        let preview: String = m.text.chars().take(160).collect();
        println!("      {preview}");
    }
    Ok(ExitCode::SUCCESS)
}

fn init(force: bool) -> Result<ExitCode, String> {
    let path = config::config_path();
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    let written = config::save(&Config::default())?;
    println!(
        "{} Config written to {}",
        "✓".green().bold(),
        written.display().to_string().bold()
    );
    println!("  Set imagery_api_key and label_endpoint before running `solmem tick`.");
    Ok(ExitCode::SUCCESS)
}
