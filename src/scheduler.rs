//! Scheduler for automated daily report generation.
//!
//! One supervisor object owns the loop: a timezone-aware cron trigger for
//! the daily pass, catch-up for missed days at startup and periodically, and
//! fixed-delay retries around each (org, date) generation. Every pass is
//! recorded in run history. Orgs run concurrently within a bounded pool;
//! days within one org run sequentially to bound load on the source.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::db::runs::NewRun;
use crate::db::ReportDb;
use crate::error::ReportError;
use crate::report::{MetricsAggregator, Mode};
use crate::source::AnalyticsSource;
use crate::types::{Organization, RunOutcome, RunType, SchedulerRun};

/// Poll interval for the scheduler loop (1 minute).
const POLL_INTERVAL_SECS: u64 = 60;

/// How often the periodic catch-up re-scans for holes (6 hours).
const CATCHUP_INTERVAL_SECS: i64 = 6 * 3600;

/// Parse a 5-field cron expression. The cron crate expects 6 fields (with
/// seconds), so "0" is prepended.
pub fn parse_cron(expr: &str) -> Result<Schedule, ReportError> {
    let full_expr = format!("0 {}", expr);
    full_expr
        .parse::<Schedule>()
        .map_err(|e| ReportError::Configuration(format!("Invalid cron expression '{expr}': {e}")))
}

/// Outcome of one (org, date) generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    Generated,
    /// A report already existed and force was not set.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub recent_runs: Vec<SchedulerRun>,
}

pub struct Scheduler {
    config: Config,
    aggregator: Arc<MetricsAggregator>,
    db_path: Option<PathBuf>,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl Scheduler {
    pub fn new(config: Config, source: Arc<dyn AnalyticsSource>) -> Result<Self, ReportError> {
        let aggregator = Arc::new(MetricsAggregator::new(source, &config)?);
        let db_path = config.db_path.clone();
        Ok(Self {
            config,
            aggregator,
            db_path,
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
        })
    }

    /// Each operation opens its own connection; SQLite's WAL mode and the
    /// busy timeout handle concurrent org tasks.
    fn open_db(&self) -> Result<ReportDb, ReportError> {
        Ok(ReportDb::open_with(self.db_path.as_deref())?)
    }

    fn cron_expr(&self) -> String {
        format!(
            "{} {} * * *",
            self.config.scheduler.minute, self.config.scheduler.hour
        )
    }

    fn scheduler_tz(&self) -> Result<Tz, ReportError> {
        self.config.scheduler.timezone.parse().map_err(|_| {
            ReportError::Configuration(format!(
                "unknown scheduler timezone {}",
                self.config.scheduler.timezone
            ))
        })
    }

    /// Next daily trigger, as a UTC instant.
    pub fn next_run(&self) -> Result<DateTime<Utc>, ReportError> {
        let schedule = parse_cron(&self.cron_expr())?;
        let tz = self.scheduler_tz()?;
        schedule
            .upcoming(tz)
            .next()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| ReportError::Configuration("No upcoming scheduled time".into()))
    }

    /// Spawn the scheduler loop. Returns without blocking; `stop()` ends it.
    pub fn start(self: &Arc<Self>) -> Result<(), ReportError> {
        if !self.config.scheduler.enabled {
            log::info!("scheduler disabled by configuration");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_loop().await;
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    pub fn status(&self) -> Result<SchedulerStatus, ReportError> {
        let recent_runs = self.open_db()?.recent_runs(20)?;
        let next_run = if self.config.scheduler.enabled {
            Some(self.next_run()?)
        } else {
            None
        };
        Ok(SchedulerStatus {
            enabled: self.config.scheduler.enabled,
            running: self.running.load(Ordering::SeqCst),
            next_run,
            recent_runs,
        })
    }

    async fn run_loop(self: Arc<Self>) {
        log::info!(
            "scheduler started: daily at {:02}:{:02} {}",
            self.config.scheduler.hour,
            self.config.scheduler.minute,
            self.config.scheduler.timezone
        );

        // Fill holes left by downtime before waiting for the first trigger.
        if let Err(e) = self.catch_up().await {
            log::warn!("startup catch-up failed: {e}");
        }

        let mut next_trigger = self.next_run().ok();
        let mut last_catchup = Utc::now();

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.stop.notified() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS)) => {}
            }

            let now = Utc::now();
            if let Some(trigger) = next_trigger {
                if now >= trigger {
                    log::info!("daily trigger fired (scheduled {trigger})");
                    self.daily_pass().await;
                    next_trigger = self.next_run().ok();
                }
            } else {
                next_trigger = self.next_run().ok();
            }

            if (now - last_catchup).num_seconds() >= CATCHUP_INTERVAL_SECS {
                if let Err(e) = self.catch_up().await {
                    log::warn!("periodic catch-up failed: {e}");
                }
                last_catchup = now;
            }
        }
        log::info!("scheduler stopped");
    }

    /// Yesterday in the org's timezone: the most recent completed day.
    fn target_date(org: &Organization) -> Result<NaiveDate, ReportError> {
        let tz: Tz = org
            .timezone
            .parse()
            .map_err(|_| ReportError::Configuration(format!("unknown timezone {}", org.timezone)))?;
        let today = Utc::now().with_timezone(&tz).date_naive();
        today
            .pred_opt()
            .ok_or_else(|| ReportError::InvalidDate(format!("no day before {today}")))
    }

    /// Generate yesterday's report for every active org. Orgs run in a
    /// bounded pool; one org's failure never blocks another's generation.
    pub async fn daily_pass(self: &Arc<Self>) {
        let orgs = match self.open_db().and_then(|db| Ok(db.active_organizations()?)) {
            Ok(orgs) => orgs,
            Err(e) => {
                log::error!("daily pass aborted, cannot list organizations: {e}");
                return;
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config.scheduler.org_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for org in orgs {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                match Self::target_date(&org) {
                    Ok(date) => {
                        this.generate_with_retries(&org, date, RunType::Daily, false)
                            .await;
                    }
                    Err(e) => log::error!("skipping org {}: {e}", org.org_id),
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Scan the last `catchup_days` days per active org and generate any day
    /// lacking a stored report. Orgs concurrent, days sequential.
    pub async fn catch_up(self: &Arc<Self>) -> Result<(), ReportError> {
        let orgs = self.open_db()?.active_organizations()?;
        if orgs.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.scheduler.org_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for org in orgs {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                if let Err(e) = this.catch_up_org(&org).await {
                    log::warn!("catch-up failed for org {}: {e}", org.org_id);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn catch_up_org(&self, org: &Organization) -> Result<(), ReportError> {
        let tz: Tz = org
            .timezone
            .parse()
            .map_err(|_| ReportError::Configuration(format!("unknown timezone {}", org.timezone)))?;
        let today = Utc::now().with_timezone(&tz).date_naive();
        let missing = self.open_db()?.missing_report_dates(
            &org.org_id,
            self.config.scheduler.catchup_days,
            today,
        )?;
        if missing.is_empty() {
            return Ok(());
        }
        log::info!(
            "catch-up: org {} is missing {} day(s)",
            org.org_id,
            missing.len()
        );
        for date in missing {
            self.generate_with_retries(org, date, RunType::Catchup, false)
                .await;
        }
        Ok(())
    }

    /// One (org, date) generation with retry and run recording.
    ///
    /// Strict mode is used so a stored report is always complete; partial
    /// payloads never persist. A pre-existing report short-circuits unless
    /// forced.
    pub async fn generate_with_retries(
        &self,
        org: &Organization,
        date: NaiveDate,
        run_type: RunType,
        force: bool,
    ) -> PassResult {
        let started_at = Utc::now();
        let max_attempts = self.config.scheduler.max_attempts.max(1);

        match self.open_db().and_then(|db| Ok(db.has_report(&org.org_id, date)?)) {
            Ok(true) if !force => {
                log::debug!("report exists for org {} on {date}, skipping", org.org_id);
                return PassResult::Skipped;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("cannot check existing report for org {}: {e}", org.org_id);
                return PassResult::Failed;
            }
        }

        let mut last_error: Option<ReportError> = None;
        let mut attempts_used = 0;
        for attempt in 1..=max_attempts {
            attempts_used = attempt;
            match self.aggregator.generate(org, date, Mode::Strict).await {
                Ok(payload) => {
                    let stored = self
                        .open_db()
                        .and_then(|db| Ok(db.upsert_report(&org.org_id, date, &payload)?));
                    match stored {
                        Ok(()) => {
                            log::info!(
                                "generated report for org {} on {date} (attempt {attempt})",
                                org.org_id
                            );
                            self.record_run(
                                run_type,
                                org,
                                date,
                                RunOutcome::Succeeded,
                                started_at,
                                1,
                                attempt - 1,
                                None,
                            );
                            return PassResult::Generated;
                        }
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(e) => last_error = Some(e),
            }

            let error = match &last_error {
                Some(e) => e,
                None => break,
            };
            if attempt < max_attempts && error.is_retryable() {
                log::warn!(
                    "attempt {attempt}/{max_attempts} failed for org {} on {date}: {error}; \
                     retrying in {:?}",
                    org.org_id,
                    self.config.scheduler.retry_delay
                );
                tokio::time::sleep(self.config.scheduler.retry_delay).await;
            } else {
                break;
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        log::error!(
            "report generation failed for org {} on {date}: {message}",
            org.org_id
        );
        self.record_run(
            run_type,
            org,
            date,
            RunOutcome::Failed,
            started_at,
            0,
            attempts_used.saturating_sub(1),
            Some(message),
        );
        PassResult::Failed
    }

    #[allow(clippy::too_many_arguments)]
    fn record_run(
        &self,
        run_type: RunType,
        org: &Organization,
        date: NaiveDate,
        outcome: RunOutcome,
        started_at: DateTime<Utc>,
        reports_generated: u32,
        retry_count: u32,
        error: Option<String>,
    ) {
        let run = NewRun {
            run_type,
            org_id: Some(org.org_id.clone()),
            report_date: Some(date.format("%Y-%m-%d").to_string()),
            outcome,
            started_at,
            completed_at: Some(Utc::now()),
            reports_generated,
            retry_count,
            error,
        };
        if let Err(e) = self.open_db().and_then(|db| Ok(db.log_run(&run)?)) {
            log::error!("failed to record scheduler run: {e}");
        }
    }

    /// Ad-hoc best-effort generation. Nothing is persisted; degraded
    /// metrics are annotated in the payload's errors map. Recorded as a
    /// manual run, partial when any metric failed.
    pub async fn preview(
        &self,
        org_id: &str,
        date: NaiveDate,
    ) -> Result<crate::types::ReportPayload, ReportError> {
        let org = self
            .open_db()?
            .get_organization(org_id)?
            .ok_or_else(|| ReportError::NotFound(format!("organization {org_id}")))?;
        let started_at = Utc::now();
        let payload = self.aggregator.generate(&org, date, Mode::BestEffort).await?;

        let (outcome, error) = if payload.errors.is_empty() {
            (RunOutcome::Succeeded, None)
        } else {
            let failed: Vec<&str> = payload.errors.keys().map(String::as_str).collect();
            (RunOutcome::Partial, Some(failed.join(", ")))
        };
        self.record_run(
            RunType::Manual,
            &org,
            date,
            outcome,
            started_at,
            0,
            0,
            error,
        );
        Ok(payload)
    }

    /// Manual trigger. Defaults to every active org and each org's most
    /// recent completed day.
    pub async fn generate_now(
        &self,
        org_id: Option<&str>,
        date: Option<NaiveDate>,
        force: bool,
    ) -> Result<Vec<(String, PassResult)>, ReportError> {
        let db = self.open_db()?;
        let orgs = match org_id {
            Some(id) => {
                let org = db
                    .get_organization(id)?
                    .ok_or_else(|| ReportError::NotFound(format!("organization {id}")))?;
                vec![org]
            }
            None => db.active_organizations()?,
        };
        drop(db);

        let mut results = Vec::new();
        for org in orgs {
            let target = match date {
                Some(d) => d,
                None => Self::target_date(&org)?,
            };
            let outcome = self
                .generate_with_retries(&org, target, RunType::Manual, force)
                .await;
            results.push((org.org_id.clone(), outcome));
        }
        Ok(results)
    }

    /// Generate every missing day in [from, to] for one org, oldest first.
    /// Existing reports are left untouched. Returns the number generated.
    pub async fn backfill(
        &self,
        org_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<u32, ReportError> {
        if from > to {
            return Err(ReportError::InvalidDate(format!(
                "backfill range {from}..={to} is inverted"
            )));
        }
        let org = self
            .open_db()?
            .get_organization(org_id)?
            .ok_or_else(|| ReportError::NotFound(format!("organization {org_id}")))?;

        let mut generated = 0;
        let mut day = from;
        while day <= to {
            if self
                .generate_with_retries(&org, day, RunType::Backfill, false)
                .await
                == PassResult::Generated
            {
                generated += 1;
            }
            day += ChronoDuration::days(1);
        }
        log::info!("backfill for org {org_id}: {generated} report(s) generated");
        Ok(generated)
    }
}
