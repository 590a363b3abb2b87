use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use skillpath_analytics::UsageAnalytics;
use skillpath_core::ids::RunId;
use skillpath_store::Database;
use skillpath_telemetry::{init_telemetry, TelemetryConfig};
use skillpath_trace::TraceReader;

#[derive(Parser)]
#[command(name = "skillpath", about = "Inspect recorded pipeline traces")]
struct Cli {
    /// Path to the trace database.
    #[arg(long, global = true, default_value_os_t = default_db_path())]
    db: PathBuf,

    /// Emit structured JSON logs.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect recorded runs.
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    /// Aggregate token and cost usage across runs.
    Usage {
        /// Run IDs to include in the report.
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RunCommand {
    /// List recent runs with status and totals.
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show the full reconstructed trace of one run.
    Show { id: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json_output: cli.json_logs,
        ..TelemetryConfig::default()
    });

    let db = Database::open(&cli.db)
        .with_context(|| format!("failed to open trace database at {}", cli.db.display()))?;
    tracing::debug!(path = %cli.db.display(), "using trace database");

    match cli.command {
        Command::Run { command } => match command {
            RunCommand::List { limit } => list_runs(db, limit),
            RunCommand::Show { id } => show_run(db, &id),
        },
        Command::Usage { ids } => usage_report(db, &ids),
    }
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".skillpath")
        .join("traces.db")
}

fn list_runs(db: Database, limit: u32) -> anyhow::Result<()> {
    let runs = skillpath_store::runs::RunRepo::new(db).list_recent(limit)?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }
    for run in runs {
        let tokens = run
            .total_tokens
            .map_or_else(|| "-".to_string(), |t| t.to_string());
        let cost = run
            .total_cost
            .map_or_else(|| "-".to_string(), |c| format!("${c:.4}"));
        println!(
            "{}  {:<12} tokens={:<8} cost={:<10} {}",
            run.id, run.status, tokens, cost, run.question
        );
    }
    Ok(())
}

fn show_run(db: Database, id: &str) -> anyhow::Result<()> {
    let reader = TraceReader::new(db);
    let Some(trace) = reader.get_run(&RunId::from_raw(id))? else {
        anyhow::bail!("run {id} not found");
    };

    println!("run {}", trace.run.id);
    println!("  status:   {}", trace.run.status);
    println!("  question: {}", trace.run.question);
    if let Some(duration) = trace.run.total_duration_ms {
        println!("  duration: {duration:.0} ms");
    }
    if let Some(tokens) = trace.run.total_tokens {
        println!("  tokens:   {tokens}");
    }
    if let Some(cost) = trace.run.total_cost {
        println!("  cost:     ${cost:.4}");
    }
    if let Some(error) = &trace.run.error {
        println!("  error:    [{}] {}", error.code, error.message);
    }

    for stage in &trace.stages {
        let duration = stage
            .row
            .duration_ms
            .map_or_else(|| "-".to_string(), |d| format!("{d:.0} ms"));
        println!("\n  [{}] {} ({duration})", stage.row.stage_order, stage.row.stage_name);
        if let Some(llm) = &stage.row.llm {
            println!(
                "    llm: {} {} tokens={} cost=${:.6}",
                llm.provider, llm.model, llm.token_usage.total_tokens, llm.cost
            );
        }
        if let Some(embedding) = &stage.row.embedding {
            println!(
                "    embedding: {} {} tokens={} skills={}",
                embedding.provider, embedding.model, embedding.total_tokens, embedding.skills_count
            );
        }
        if let Some(error) = &stage.row.error {
            println!("    error: [{}] {}", error.code, error.message);
        }
        if let Some(raw) = &stage.row.output_raw {
            println!("    output: {raw}");
        }
    }
    Ok(())
}

fn usage_report(db: Database, ids: &[String]) -> anyhow::Result<()> {
    let run_ids: Vec<RunId> = ids.iter().map(RunId::from_raw).collect();
    let report = UsageAnalytics::new(db).report(&run_ids)?;

    println!("runs:             {}", report.run_count);
    println!(
        "llm:              {} tokens  ${:.6}",
        report.breakdown.llm_tokens, report.breakdown.llm_cost
    );
    println!(
        "embedding:        {} tokens  ${:.6}",
        report.breakdown.embedding_tokens, report.breakdown.embedding_cost
    );
    println!(
        "total:            {} tokens  ${:.6}",
        report.breakdown.total_tokens, report.breakdown.total_cost
    );
    println!("cost p50 / p95:   ${:.6} / ${:.6}", report.p50_cost, report.p95_cost);

    println!("\nby category:");
    for (category, totals) in &report.by_category {
        println!("  {:<28} {} tokens  ${:.6}", category, totals.tokens, totals.cost);
    }

    println!("\ncost distribution:");
    for bucket in &report.cost_histogram {
        println!(
            "  {:.6}..{:.6}  {:>4}  {:>5.1}%",
            bucket.lower, bucket.upper, bucket.count, bucket.percentage
        );
    }
    Ok(())
}
