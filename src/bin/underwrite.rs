//! CLI binary for underwrite-pipeline.
//!
//! A thin shim over the library crate: maps CLI flags to `AnalysisConfig`,
//! submits one document, renders its progress events and prints the result.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use underwrite_pipeline::pipeline::input::load_document;
use underwrite_pipeline::{
    AnalysisConfig, AnalysisResult, Analyzer, DocumentCategory, FileJobStore, InMemoryJobStore,
    JobId, JobOptions, JobStatus, JobStore, ProgressEvent,
};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const SPINNER_TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Analyse a life submission, human-readable summary on stdout
  underwrite application.pdf

  # Full result as JSON
  underwrite --json application.pdf -o result.json

  # Property & casualty packet, classify first, larger batches
  underwrite --category property_casualty --classify --batch-size 5 submission.pdf

  # Stream progress as server-sent-event frames
  underwrite --events application.pdf

  # Persist jobs and resume one that failed part-way
  underwrite --store-dir ./jobs application.pdf
  underwrite --store-dir ./jobs --resume 6f1c0a52-... application.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_PROVIDER      Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override primary model ID
  UNDERWRITE_FAST_MODEL   Model used for short focus summaries
"#;

/// Analyse a multi-page PDF submission into an underwriting risk assessment.
#[derive(Parser, Debug)]
#[command(
    name = "underwrite",
    version,
    about = "Analyse PDF submissions into a structured underwriting risk assessment",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write the result to this file instead of stdout.
    #[arg(short, long, env = "UNDERWRITE_OUTPUT")]
    output: Option<PathBuf>,

    /// Primary model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Fast model ID for focus summaries.
    #[arg(long, env = "UNDERWRITE_FAST_MODEL")]
    fast_model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Line of business: life or property_casualty.
    #[arg(long, env = "UNDERWRITE_CATEGORY", default_value = "life")]
    category: String,

    /// Classify the document from its first page before extraction.
    #[arg(long, env = "UNDERWRITE_CLASSIFY")]
    classify: bool,

    /// Pages per extraction call.
    #[arg(long, env = "UNDERWRITE_BATCH_SIZE", default_value_t = 3)]
    batch_size: usize,

    /// Page records per synthesis refinement round.
    #[arg(long, env = "UNDERWRITE_SYNTHESIS_BATCH_SIZE", default_value_t = 10)]
    synthesis_batch_size: usize,

    /// Only analyse the first N pages.
    #[arg(long, env = "UNDERWRITE_PAGE_LIMIT")]
    page_limit: Option<usize>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "UNDERWRITE_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Output tokens per model round.
    #[arg(long, env = "UNDERWRITE_MAX_TOKENS", default_value_t = 2048)]
    max_tokens: usize,

    /// Transport retries per model round.
    #[arg(long, env = "UNDERWRITE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Time budget in seconds for one logical model call.
    #[arg(long, env = "UNDERWRITE_CALL_TIMEOUT", default_value_t = 300)]
    call_timeout: u64,

    /// Skip the "current focus" summaries between synthesis rounds.
    #[arg(long, env = "UNDERWRITE_NO_FOCUS")]
    no_focus: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "UNDERWRITE_PASSWORD")]
    password: Option<String>,

    /// Persist job snapshots as JSON files in this directory.
    #[arg(long, env = "UNDERWRITE_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Resume a persisted job instead of starting a new one (needs --store-dir).
    #[arg(long, requires = "store_dir")]
    resume: Option<String>,

    /// Output the full result as JSON.
    #[arg(long, env = "UNDERWRITE_JSON")]
    json: bool,

    /// Print progress events as SSE frames on stdout.
    #[arg(long, conflicts_with = "json")]
    events: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "UNDERWRITE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "UNDERWRITE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless -v is given.
    let show_progress = !cli.quiet && !cli.events;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build analyzer ───────────────────────────────────────────────────
    let config = build_config(&cli)?;
    let store: Arc<dyn JobStore> = match &cli.store_dir {
        Some(dir) => Arc::new(FileJobStore::new(dir)),
        None => Arc::new(InMemoryJobStore::new()),
    };
    let analyzer = Analyzer::from_config(config.clone(), store)
        .context("Failed to initialise LLM provider")?;

    let document = load_document(&cli.input, config.call_timeout_secs)
        .await
        .with_context(|| format!("Failed to load '{}'", cli.input))?;

    let id = match &cli.resume {
        Some(raw) => {
            let id: JobId = raw
                .parse()
                .with_context(|| format!("Invalid job id '{raw}'"))?;
            analyzer.resume(id, document).await.context("Resume failed")?
        }
        None => {
            let mut options = JobOptions::default().with_batch_size(cli.batch_size);
            if let Some(limit) = cli.page_limit {
                options = options.with_page_limit(limit);
            }
            analyzer
                .submit(document, options)
                .await
                .context("Submission rejected")?
        }
    };
    if !cli.quiet {
        eprintln!("{} job {}", dim("◆"), bold(&id.to_string()));
    }

    // ── Follow progress ──────────────────────────────────────────────────
    let mut events = analyzer.subscribe(id).await.context("Failed to subscribe")?;
    let bar = show_progress.then(new_spinner);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                if cli.events {
                    print!("{}", event.to_sse());
                    io::stdout().flush().ok();
                }
                if let Some(bar) = &bar {
                    render_event(bar, &event);
                }
            }
            _ = &mut ctrl_c, if !cancel_sent => {
                cancel_sent = true;
                if let Some(bar) = &bar {
                    bar.println(yellow("Cancelling…"));
                }
                analyzer.cancel(id).await.context("Cancel failed")?;
            }
        }
    }
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    // ── Report ───────────────────────────────────────────────────────────
    let result = match analyzer.wait(id).await {
        Ok(result) => result,
        Err(e) => {
            let stored = analyzer.get_result(id).await.ok();
            if let Some(result) = stored {
                if result.status == JobStatus::Cancelled {
                    eprintln!("{} job cancelled", yellow("⚠"));
                    std::process::exit(130);
                }
            }
            return Err(e).context("Analysis failed");
        }
    };

    if !cli.events {
        let rendered = if cli.json {
            serde_json::to_string_pretty(&result).context("Failed to serialise result")?
        } else {
            render_summary(&result)
        };
        match &cli.output {
            Some(path) => tokio::fs::write(path, rendered.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?,
            None => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                handle
                    .write_all(rendered.as_bytes())
                    .context("Failed to write to stdout")?;
                if !rendered.ends_with('\n') {
                    handle.write_all(b"\n").ok();
                }
            }
        }
    }

    if !cli.quiet {
        let s = &result.stats;
        eprintln!(
            "{}  {} pages ({} errors, {} placeholders)  {} model calls  {}ms",
            if s.error_pages == 0 { green("✔") } else { yellow("⚠") },
            s.total_pages,
            s.error_pages,
            s.placeholder_pages,
            s.model_calls,
            s.total_duration_ms,
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out",
            dim(&s.total_input_tokens.to_string()),
            dim(&s.total_output_tokens.to_string()),
        );
    }

    Ok(())
}

/// Map CLI args to `AnalysisConfig`.
fn build_config(cli: &Cli) -> Result<AnalysisConfig> {
    let category: DocumentCategory = cli.category.parse().context("Invalid --category")?;
    let mut config = AnalysisConfig::builder()
        .batch_size(cli.batch_size)
        .synthesis_batch_size(cli.synthesis_batch_size)
        .category(category)
        .classify(cli.classify)
        .dpi(cli.dpi)
        .max_tokens(cli.max_tokens)
        .max_retries(cli.max_retries)
        .call_timeout_secs(cli.call_timeout)
        .focus_updates(!cli.no_focus)
        .build()
        .context("Invalid configuration")?;

    config.page_limit = cli.page_limit;
    config.model = cli.model.clone();
    config.fast_model = cli.fast_model.clone();
    config.provider_name = cli.provider.clone();
    config.password = cli.password.clone();
    Ok(config)
}

fn new_spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed_precise}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER_TICKS),
    );
    bar.set_prefix("Analysing");
    bar.set_message("Opening PDF…");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn render_event(bar: &ProgressBar, event: &ProgressEvent) {
    match event {
        ProgressEvent::Progress { message } => bar.set_message(message.clone()),
        ProgressEvent::BatchComplete { message, pages } => {
            let failed = pages.iter().filter(|p| p.is_error()).count();
            let mark = if failed == 0 { green("✓") } else { red("✗") };
            bar.println(format!("  {mark} {message}"));
        }
        ProgressEvent::PhaseComplete { phase } => {
            bar.println(format!("{} {:?} finished", green("◆"), phase));
        }
        ProgressEvent::Warning { message } => bar.println(format!("  {} {}", yellow("⚠"), message)),
        ProgressEvent::Error { message } => bar.println(format!("{} {}", red("✘"), message)),
        ProgressEvent::Complete { .. } => bar.set_message("done"),
    }
}

/// Plain-text rendering of the four synthesis sections.
fn render_summary(result: &AnalysisResult) -> String {
    let Some(synthesis) = &result.synthesis else {
        return format!("No assessment ({})", result.status);
    };
    let mut out = String::new();
    if let Some(kind) = result.document_type {
        out.push_str(&format!("Document type: {kind}\n\n"));
    }
    for (title, body) in [
        ("RISK ASSESSMENT", &synthesis.risk_assessment),
        ("DISCREPANCIES", &synthesis.discrepancies),
        ("MEDICAL TIMELINE", &synthesis.timeline),
        ("FINAL RECOMMENDATION", &synthesis.final_recommendation),
    ] {
        out.push_str(&format!("## {title}\n\n{}\n\n", body.trim()));
    }
    out
}
