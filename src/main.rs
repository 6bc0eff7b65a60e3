use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use engagement_ledger::config::Config;
use engagement_ledger::db::{self, PgStore};
use engagement_ledger::models::{PostId, UserKey, Vote};
use engagement_ledger::{import, report, Ledger, LedgerSettings};

#[derive(Parser)]
#[command(name = "engagement-ledger")]
#[command(about = "Streaks, daily activity and vote tallies derived from user actions", long_about = None)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample posts
    Seed,
    /// Replay action events from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Cast, switch or clear a vote on a post
    Vote {
        #[arg(long)]
        user: String,
        #[arg(long)]
        post: PostId,
        /// up, down or none
        #[arg(long)]
        vote: String,
    },
    /// Save or unsave a post
    Save {
        #[arg(long)]
        user: String,
        #[arg(long)]
        post: PostId,
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        saved: bool,
    },
    /// Flip a problem's solved flag
    ToggleProblem {
        #[arg(long)]
        user: String,
        #[arg(long)]
        problem: String,
        #[arg(long)]
        topic: String,
    },
    /// Report how far a video has been watched
    Video {
        #[arg(long)]
        user: String,
        #[arg(long)]
        video: String,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        percentage: u8,
    },
    /// Count a sent message
    Message {
        #[arg(long)]
        user: String,
    },
    /// Log study time
    Study {
        #[arg(long)]
        user: String,
        #[arg(long)]
        minutes: i64,
    },
    /// Show dashboard stats
    Dashboard {
        #[arg(long)]
        user: String,
    },
    /// Show the per-day activity heatmap
    Heatmap {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Generate a markdown engagement report
    Report {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Recompute post vote tallies from interaction rows
    Repair,
}

fn print<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value:#?}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = db::connect(&config)
        .await
        .context("failed to connect to Postgres")?;
    let ledger = Ledger::new(
        PgStore::new(pool.clone(), config.lock_timeout_ms),
        LedgerSettings::from(&config),
    );
    let json = cli.json;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(ledger.store()).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let summary = import::import_csv(&ledger, &csv).await?;
            println!(
                "Applied {} events from {} ({} rejected).",
                summary.applied,
                csv.display(),
                summary.rejected
            );
        }
        Commands::Vote { user, post, vote } => {
            let user = UserKey::parse(&user)?;
            let vote: Vote = vote.parse()?;
            let state = ledger.submit_vote(&user, post, vote).await?;
            print(json, &state)?;
        }
        Commands::Save { user, post, saved } => {
            let user = UserKey::parse(&user)?;
            let state = ledger.set_saved(&user, post, saved).await?;
            print(json, &state)?;
        }
        Commands::ToggleProblem {
            user,
            problem,
            topic,
        } => {
            let user = UserKey::parse(&user)?;
            let outcome = ledger.toggle_problem(&user, &problem, &topic).await?;
            print(json, &outcome)?;
        }
        Commands::Video {
            user,
            video,
            topic,
            percentage,
        } => {
            let user = UserKey::parse(&user)?;
            let outcome = ledger
                .mark_video_progress(&user, &video, &topic, percentage)
                .await?;
            print(json, &outcome)?;
        }
        Commands::Message { user } => {
            let user = UserKey::parse(&user)?;
            let day = ledger.record_message_sent(&user).await?;
            print(json, &day)?;
        }
        Commands::Study { user, minutes } => {
            let user = UserKey::parse(&user)?;
            let progress = ledger.log_study_minutes(&user, minutes).await?;
            print(json, &progress)?;
        }
        Commands::Dashboard { user } => {
            let user = UserKey::parse(&user)?;
            let stats = ledger.get_dashboard_stats(&user).await?;
            print(json, &stats)?;
        }
        Commands::Heatmap { user, days } => {
            let user = UserKey::parse(&user)?;
            let heatmap = ledger.get_heatmap(&user, days).await?;
            if json {
                print(json, &heatmap)?;
            } else {
                for day in &heatmap {
                    println!(
                        "{}  problems {:>3}  videos {:>3}  messages {:>3}  minutes {:>4}",
                        day.date,
                        day.counts.problems_solved,
                        day.counts.videos_watched,
                        day.counts.messages_sent,
                        day.counts.study_minutes
                    );
                }
            }
        }
        Commands::Report { user, days, out } => {
            let user = UserKey::parse(&user)?;
            let stats = ledger.get_dashboard_stats(&user).await?;
            let heatmap = ledger.get_heatmap(&user, days).await?;
            let report = report::build_report(&user, ledger.today(), &stats, &heatmap);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Repair => {
            let repaired = ledger.repair_post_tallies().await?;
            info!(repaired, "repair sweep finished");
            println!("Repaired {repaired} post tallies.");
        }
    }

    Ok(())
}
