//! Billsync Background Worker
//!
//! One-shot modes:
//! - Subscription sync over a filtered population (default)
//! - Dangling gateway subscription sweep (`--clear-dangling`)
//! - Read-only invariant checks (`--check-invariants`)
//!
//! With `--schedule` it instead runs the sync and the sweep as cron jobs.

use std::sync::Arc;

use anyhow::Context;
use billsync_billing::{
    BatchFilter, BillingService, InvariantChecker, ReconciliationResult, SyncReport,
};
use clap::Parser;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "billsync-worker", version, about = "Subscription sync jobs")]
struct Args {
    /// Cancel gateway subscriptions no local record references
    #[arg(
        long,
        conflicts_with_all = ["days_left", "days_ago", "day_start", "day_end", "user_ids", "active_only"]
    )]
    clear_dangling: bool,

    /// Sync records whose period ends within the next N days
    #[arg(long, conflicts_with_all = ["days_ago", "day_start", "day_end"])]
    days_left: Option<u32>,

    /// Sync records whose period ended within the last N days
    #[arg(long, conflicts_with_all = ["day_start", "day_end"])]
    days_ago: Option<u32>,

    /// Start of a period-end window, in days from now
    #[arg(long, requires = "day_end", allow_hyphen_values = true)]
    day_start: Option<i64>,

    /// End of a period-end window, in days from now
    #[arg(long, requires = "day_start", allow_hyphen_values = true)]
    day_end: Option<i64>,

    /// Only sync these users (repeatable)
    #[arg(long = "user-id")]
    user_ids: Vec<Uuid>,

    /// Only sync records bound to a gateway subscription
    #[arg(long)]
    active_only: bool,

    /// Run invariant checks and exit
    #[arg(
        long,
        conflicts_with_all = [
            "clear_dangling", "schedule", "days_left", "days_ago", "day_start", "day_end",
            "user_ids", "active_only",
        ]
    )]
    check_invariants: bool,

    /// Run as a long-lived cron scheduler
    #[arg(
        long,
        conflicts_with_all = [
            "clear_dangling", "days_left", "days_ago", "day_start", "day_end", "user_ids",
            "active_only",
        ]
    )]
    schedule: bool,

    #[arg(long, env = "SYNC_CRON", default_value = "0 0 3 * * *")]
    sync_cron: String,

    #[arg(long, env = "DANGLING_CRON", default_value = "0 0 4 * * Sun")]
    dangling_cron: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Sync(BatchFilter),
    ClearDangling,
    CheckInvariants,
    Schedule,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.schedule {
            Mode::Schedule
        } else if self.check_invariants {
            Mode::CheckInvariants
        } else if self.clear_dangling {
            Mode::ClearDangling
        } else {
            Mode::Sync(self.filter())
        }
    }

    fn filter(&self) -> BatchFilter {
        BatchFilter {
            user_ids: (!self.user_ids.is_empty()).then(|| self.user_ids.clone()),
            active_only: self.active_only,
            days_left: self.days_left,
            days_ago: self.days_ago,
            day_start: self.day_start,
            day_end: self.day_end,
        }
    }
}

/// Log a batch's outcome counts and each failed user
fn log_sync_results(results: &[ReconciliationResult]) -> SyncReport {
    let report = SyncReport::from_results(results);

    info!(
        total = report.total,
        updated = report.updated,
        unchanged = report.unchanged,
        created = report.created,
        orphan_cancelled = report.orphan_cancelled,
        errors = report.errors,
        "Subscription sync complete"
    );

    for result in results.iter().filter(|r| r.is_error()) {
        error!(
            user_id = %result.user_id,
            error = result.detail.as_deref().unwrap_or("unknown"),
            "Failed to reconcile subscription"
        );
    }

    report
}

async fn run_sync(billing: &BillingService, filter: &BatchFilter) -> anyhow::Result<SyncReport> {
    let results = billing
        .engine
        .reconcile_batch(filter)
        .await
        .context("Failed to load sync candidates")?;
    Ok(log_sync_results(&results))
}

async fn run_sweep(billing: &BillingService) -> anyhow::Result<usize> {
    let cancelled = billing
        .engine
        .sweep_dangling_remote_subscriptions()
        .await
        .context("Dangling subscription sweep failed")?;
    info!(cancelled, "Dangling subscription sweep complete");
    Ok(cancelled)
}

async fn run_invariant_checks(pool: PgPool) -> anyhow::Result<()> {
    let summary = InvariantChecker::new(pool).run_all_checks().await?;

    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            users = violation.user_ids.len(),
            "{}",
            violation.description
        );
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.healthy {
        anyhow::bail!(
            "{} of {} invariant checks failed",
            summary.checks_failed,
            summary.checks_run
        );
    }
    Ok(())
}

async fn run_scheduler(billing: Arc<BillingService>, args: &Args) -> anyhow::Result<()> {
    let mut scheduler = JobScheduler::new().await?;

    // Full sync of every bound record
    let sync_billing = billing.clone();
    scheduler
        .add(Job::new_async(args.sync_cron.as_str(), move |_uuid, _l| {
            let billing = sync_billing.clone();
            Box::pin(async move {
                info!("Running scheduled subscription sync");
                if let Err(e) = run_sync(&billing, &BatchFilter::default()).await {
                    error!(error = %e, "Scheduled subscription sync failed");
                }
            })
        })?)
        .await?;
    info!(cron = %args.sync_cron, "Scheduled: Subscription sync");

    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async(args.dangling_cron.as_str(), move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running scheduled dangling subscription sweep");
                if let Err(e) = run_sweep(&billing).await {
                    error!(error = %e, "Scheduled dangling sweep failed");
                }
            })
        })?)
        .await?;
    info!(cron = %args.dangling_cron, "Scheduled: Dangling subscription sweep");

    info!("Starting job scheduler");
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    billsync_shared::init_tracing("info");

    let args = Args::parse();
    let mode = args.mode();

    // Reject bad window combinations before touching the database
    if let Mode::Sync(filter) = &mode {
        filter.to_query(OffsetDateTime::now_utc())?;
    }

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let pool = billsync_shared::create_pool(&database_url, max_connections).await?;

    if mode == Mode::CheckInvariants {
        return run_invariant_checks(pool).await;
    }

    let billing = Arc::new(BillingService::from_env(pool)?);
    info!(mode = ?mode, "Starting Billsync worker");

    match mode {
        Mode::Sync(filter) => {
            let report = run_sync(&billing, &filter).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.has_errors() {
                warn!(errors = report.errors, "Sync finished with per-user errors");
            }
        }
        Mode::ClearDangling => {
            let cancelled = run_sweep(&billing).await?;
            println!("{}", serde_json::json!({ "cancelled": cancelled }));
        }
        Mode::Schedule => run_scheduler(billing, &args).await?,
        Mode::CheckInvariants => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn parse(flags: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("billsync-worker").chain(flags.iter().copied()))
    }

    #[test]
    fn test_default_is_full_sync() {
        assert_eq!(parse(&[]).unwrap().mode(), Mode::Sync(BatchFilter::default()));
    }

    #[test]
    fn test_window_flags_map_to_filter() {
        let args = parse(&["--days-left", "7", "--active-only"]).unwrap();
        assert_eq!(
            args.mode(),
            Mode::Sync(BatchFilter {
                days_left: Some(7),
                active_only: true,
                ..Default::default()
            })
        );

        let args = parse(&["--day-start", "-2", "--day-end", "3"]).unwrap();
        let filter = args.filter();
        assert_eq!(filter.day_start, Some(-2));
        assert_eq!(filter.day_end, Some(3));
    }

    #[test]
    fn test_user_ids_repeatable() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let args = parse(&["--user-id", &a.to_string(), "--user-id", &b.to_string()]).unwrap();
        assert_eq!(args.filter().user_ids, Some(vec![a, b]));
    }

    #[test]
    fn test_conflicting_modes_rejected() {
        assert!(parse(&["--clear-dangling", "--days-left", "3"]).is_err());
        assert!(parse(&["--days-left", "3", "--days-ago", "3"]).is_err());
        assert!(parse(&["--day-start", "1"]).is_err());
        assert!(parse(&["--check-invariants", "--schedule"]).is_err());
    }

    #[test]
    fn test_non_sync_modes_reject_sync_filters() {
        let user = Uuid::new_v4().to_string();
        let filters: [&[&str]; 5] = [
            &["--days-left", "7"],
            &["--days-ago", "7"],
            &["--day-start", "0", "--day-end", "3"],
            &["--user-id", &user],
            &["--active-only"],
        ];
        for mode in ["--schedule", "--check-invariants"] {
            for filter in filters {
                let mut flags = vec![mode];
                flags.extend_from_slice(filter);
                assert!(parse(&flags).is_err(), "{mode} accepted {filter:?}");
            }
        }
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(parse(&["--clear-dangling"]).unwrap().mode(), Mode::ClearDangling);
        assert_eq!(parse(&["--check-invariants"]).unwrap().mode(), Mode::CheckInvariants);
        assert_eq!(parse(&["--schedule"]).unwrap().mode(), Mode::Schedule);
    }

    #[test]
    fn test_log_sync_results_counts() {
        let id = Uuid::new_v4();
        let results = vec![
            ReconciliationResult::error(
                id,
                &billsync_billing::BillingError::LockContention(id),
            ),
        ];
        let report = log_sync_results(&results);
        assert_eq!(report.total, 1);
        assert!(report.has_errors());
    }
}
