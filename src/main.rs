use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use deliberation_engine::access::StaticAuthorizer;
use deliberation_engine::config::EngineConfig;
use deliberation_engine::ledger::AdjustmentRequest;
use deliberation_engine::logging;
use deliberation_engine::models::{
    Components, Decision, DeliberationStatus, Mention, ModificationType, ResultAmendment,
};
use deliberation_engine::notify::TracingSink;
use deliberation_engine::report;
use deliberation_engine::store::PgStore;
use deliberation_engine::{Engine, EngineError};

#[derive(Parser)]
#[command(name = "deliberation-engine")]
#[command(about = "Compile cohort deliberations and keep an audited grade adjustment ledger", long_about = None)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,
    /// TOML file with policy, grants and pool size
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Acting user id, checked against the configured grants
    #[arg(long, env = "DELIBERATION_ACTOR", global = true)]
    actor: Option<Uuid>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small cohort with a draft deliberation
    Seed,
    /// Import raw component scores from a CSV file
    ImportGrades {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Compute, classify and rank every student of a deliberation
    Compile {
        #[arg(long)]
        deliberation: Uuid,
    },
    /// Show one student's unranked result without saving it
    Preview {
        #[arg(long)]
        deliberation: Uuid,
        #[arg(long)]
        student: Uuid,
    },
    /// Change grade components with a justification
    Adjust {
        #[arg(long)]
        grade: Uuid,
        #[arg(long)]
        continuous: Option<f64>,
        #[arg(long)]
        practical: Option<f64>,
        #[arg(long)]
        exam: Option<f64>,
        #[arg(long)]
        justification: String,
        #[arg(long, default_value = "correction")]
        kind: ModificationType,
        #[arg(long)]
        deliberation: Option<Uuid>,
        #[arg(long)]
        approved_by: Option<Uuid>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List compiled results in rank order
    Results {
        #[arg(long)]
        deliberation: Uuid,
        #[arg(long)]
        json: bool,
    },
    /// List a student's results across deliberations
    History {
        #[arg(long)]
        student: Uuid,
    },
    /// List ledger entries for a grade
    GradeLog {
        #[arg(long)]
        grade: Uuid,
    },
    /// Hand-edit one compiled result row
    AmendResult {
        #[arg(long)]
        deliberation: Uuid,
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        decision: Option<Decision>,
        /// A mention, or "none" to clear it
        #[arg(long)]
        mention: Option<String>,
        #[arg(long)]
        remarks: Option<String>,
    },
    /// Force a deliberation status
    SetStatus {
        #[arg(long)]
        deliberation: Uuid,
        #[arg(long)]
        status: DeliberationStatus,
    },
    /// Deliver pending notifications
    Dispatch {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        deliberation: Uuid,
        #[arg(long, default_value = "deliberation-report.md")]
        out: PathBuf,
    },
    /// Export compiled results as CSV
    Export {
        #[arg(long)]
        deliberation: Uuid,
        #[arg(long)]
        csv: PathBuf,
    },
}

fn require_actor(actor: Option<Uuid>) -> anyhow::Result<Uuid> {
    actor.context("--actor (or DELIBERATION_ACTOR) is required for this command")
}

fn parse_mention(value: Option<String>) -> anyhow::Result<Option<Option<Mention>>> {
    match value.as_deref().map(str::trim) {
        None => Ok(None),
        Some("none") => Ok(Some(None)),
        Some(other) => Ok(Some(Some(other.parse()?))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose, cli.log_level.as_deref(), cli.log_json)
        .map_err(|err| anyhow::anyhow!("failed to initialise logging: {err}"))?;

    if let Err(err) = run(cli).await {
        if let Some(engine_err) = err.downcast_ref::<EngineError>() {
            tracing::error!(
                outcome = ?engine_err.outcome(),
                retryable = engine_err.is_retryable(),
                "command failed"
            );
        }
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load config")?;
    let store = Arc::new(
        PgStore::connect(&cli.database_url, config.max_connections)
            .await
            .context("failed to connect to Postgres")?,
    );

    match &cli.command {
        Commands::InitDb => {
            store.init_db().await?;
            println!("Schema ready.");
            return Ok(());
        }
        Commands::Seed => {
            let deliberation_id = store.seed(&config.policy.weights).await?;
            println!("Seed data inserted. Draft deliberation {deliberation_id}.");
            return Ok(());
        }
        Commands::ImportGrades { csv } => {
            let summary = store
                .import_grades_csv(csv, &config.policy.weights)
                .await?;
            println!(
                "Imported {} grades from {} ({} unchanged).",
                summary.written,
                csv.display(),
                summary.unchanged
            );
            if summary.skipped_validated > 0 {
                println!(
                    "Skipped {} validated grades; change them with `adjust`.",
                    summary.skipped_validated
                );
            }
            return Ok(());
        }
        _ => {}
    }

    let engine = Engine::new(
        store,
        Arc::new(StaticAuthorizer::new(config.grants)),
        Arc::new(TracingSink),
        config.policy,
    )?;

    match cli.command {
        Commands::InitDb | Commands::Seed | Commands::ImportGrades { .. } => {}
        Commands::Compile { deliberation } => {
            let actor = require_actor(cli.actor)?;
            let compiled = engine.compiler.compile(actor, deliberation).await?;
            println!(
                "Compiled {} results; deliberation is {}.",
                compiled.results.len(),
                compiled.deliberation.status
            );
            if !compiled.standing_review.is_empty() {
                println!("Standing review requested for:");
                for student_id in compiled.standing_review.iter() {
                    println!("- {student_id}");
                }
            }
        }
        Commands::Preview {
            deliberation,
            student,
        } => {
            let actor = require_actor(cli.actor)?;
            let result = engine
                .compiler
                .preview_student(actor, deliberation, student)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Adjust {
            grade,
            continuous,
            practical,
            exam,
            justification,
            kind,
            deliberation,
            approved_by,
            notes,
        } => {
            let actor = require_actor(cli.actor)?;
            let receipt = engine
                .ledger
                .adjust(
                    actor,
                    AdjustmentRequest {
                        grade_id: grade,
                        components: Components::new(continuous, practical, exam),
                        justification,
                        modification_type: kind,
                        deliberation_id: deliberation,
                        approved_by,
                        approval_notes: notes,
                    },
                )
                .await?;
            println!(
                "Recorded modification {}: final score {} -> {}.",
                receipt.modification.id,
                receipt
                    .modification
                    .old_final_score
                    .map_or_else(|| "none".to_string(), |s| format!("{s:.2}")),
                receipt
                    .modification
                    .new_final_score
                    .map_or_else(|| "none".to_string(), |s| format!("{s:.2}"))
            );
            if let Some(deliberation) = receipt.deliberation {
                println!("Deliberation {} is {}.", deliberation.id, deliberation.status);
            }
            println!(
                "Notifications delivered: {}, pending: {}.",
                receipt.notifications.delivered, receipt.notifications.failed
            );
        }
        Commands::Results { deliberation, json } => {
            let actor = require_actor(cli.actor)?;
            let results = engine.reader.list_results(actor, deliberation).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results compiled for this deliberation.");
            } else {
                for result in results.iter() {
                    println!(
                        "- #{} {} average {} credits {}/{} {}",
                        result.rank.map_or_else(|| "-".to_string(), |r| r.to_string()),
                        result.student_id,
                        result
                            .average
                            .map_or_else(|| "n/a".to_string(), |a| format!("{a:.2}")),
                        result.credits_obtained,
                        result.credits_required,
                        result.decision
                    );
                }
            }
        }
        Commands::History { student } => {
            let actor = require_actor(cli.actor)?;
            let history = engine.reader.student_history(actor, student).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::GradeLog { grade } => {
            let actor = require_actor(cli.actor)?;
            let entries = engine.ledger.history(actor, grade).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::AmendResult {
            deliberation,
            student,
            decision,
            mention,
            remarks,
        } => {
            let actor = require_actor(cli.actor)?;
            let amendment = ResultAmendment {
                decision,
                mention: parse_mention(mention)?,
                remarks,
            };
            let amended = engine
                .reader
                .amend_result(actor, deliberation, student, amendment)
                .await?;
            println!("{}", serde_json::to_string_pretty(&amended)?);
        }
        Commands::SetStatus {
            deliberation,
            status,
        } => {
            let actor = require_actor(cli.actor)?;
            let updated = engine
                .reader
                .override_status(actor, deliberation, status)
                .await?;
            println!("Deliberation {} is now {}.", updated.id, updated.status);
        }
        Commands::Dispatch { limit } => {
            let summary = engine.dispatcher.dispatch_pending(limit).await?;
            println!(
                "Delivered {} notifications; {} still pending.",
                summary.delivered, summary.failed
            );
        }
        Commands::Report { deliberation, out } => {
            let actor = require_actor(cli.actor)?;
            let built = engine.report(actor, deliberation).await?;
            std::fs::write(&out, report::build_report(&built))
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export { deliberation, csv } => {
            let actor = require_actor(cli.actor)?;
            let built = engine.report(actor, deliberation).await?;
            let written = report::export_csv(&built.rows, &csv)?;
            println!("Exported {written} results to {}.", csv.display());
        }
    }

    Ok(())
}
