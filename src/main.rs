//! callpulse binary.
//!
//! Subcommands:
//!   run                          start the scheduler daemon
//!   generate [--org ID] [--date YYYY-MM-DD] [--force]
//!   backfill --org ID --from YYYY-MM-DD --to YYYY-MM-DD
//!   status                       print scheduler status as JSON

use std::process::ExitCode;
use std::sync::Arc;

use chrono::NaiveDate;

use callpulse::{ClickHouseSource, Config, ReportDb, ReportError, Scheduler};

fn usage() -> ExitCode {
    eprintln!(
        "usage: callpulse <run | generate [--org ID] [--date YYYY-MM-DD] [--force] \
         | backfill --org ID --from DATE --to DATE | status>"
    );
    ExitCode::FAILURE
}

struct Args {
    org: Option<String>,
    date: Option<NaiveDate>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    force: bool,
}

fn parse_flags(args: &[String]) -> Result<Args, ReportError> {
    let mut parsed = Args {
        org: None,
        date: None,
        from: None,
        to: None,
        force: false,
    };
    let parse_date = |raw: &str| -> Result<NaiveDate, ReportError> {
        raw.parse()
            .map_err(|_| ReportError::InvalidDate(format!("expected YYYY-MM-DD, got '{raw}'")))
    };
    let mut it = args.iter();
    while let Some(flag) = it.next() {
        match flag.as_str() {
            "--force" => parsed.force = true,
            "--org" | "--date" | "--from" | "--to" => {
                let value = it.next().ok_or_else(|| {
                    ReportError::Configuration(format!("{flag} requires a value"))
                })?;
                match flag.as_str() {
                    "--org" => parsed.org = Some(value.clone()),
                    "--date" => parsed.date = Some(parse_date(value)?),
                    "--from" => parsed.from = Some(parse_date(value)?),
                    _ => parsed.to = Some(parse_date(value)?),
                }
            }
            other => {
                return Err(ReportError::Configuration(format!(
                    "unknown argument '{other}'"
                )))
            }
        }
    }
    Ok(parsed)
}

fn build_scheduler(config: &Config) -> Result<Arc<Scheduler>, ReportError> {
    let source = Arc::new(ClickHouseSource::new(config.source.clone())?);
    Ok(Arc::new(Scheduler::new(config.clone(), source)?))
}

async fn run_daemon(config: Config) -> Result<(), ReportError> {
    let db = ReportDb::open_with(config.db_path.as_deref())?;
    if db.seed_default_organization()?.is_none() && db.active_organizations()?.is_empty() {
        log::warn!("no active organizations registered; nothing will be scheduled");
    }
    drop(db);

    let scheduler = build_scheduler(&config)?;
    scheduler.start()?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ReportError::Configuration(format!("signal handler: {e}")))?;
    log::info!("shutdown requested");
    scheduler.stop();
    Ok(())
}

async fn run(command: &str, args: Args, config: Config) -> Result<(), ReportError> {
    match command {
        "run" => run_daemon(config).await,
        "generate" => {
            let scheduler = build_scheduler(&config)?;
            let results = scheduler
                .generate_now(args.org.as_deref(), args.date, args.force)
                .await?;
            for (org_id, outcome) in results {
                println!("{org_id}: {outcome:?}");
            }
            Ok(())
        }
        "backfill" => {
            let (Some(org), Some(from), Some(to)) = (args.org.as_deref(), args.from, args.to)
            else {
                return Err(ReportError::Configuration(
                    "backfill requires --org, --from and --to".into(),
                ));
            };
            let scheduler = build_scheduler(&config)?;
            let generated = scheduler.backfill(org, from, to).await?;
            println!("{generated} report(s) generated");
            Ok(())
        }
        "status" => {
            let scheduler = build_scheduler(&config)?;
            let status = scheduler.status()?;
            let rendered = serde_json::to_string_pretty(&status)
                .map_err(|e| ReportError::Configuration(format!("status encoding: {e}")))?;
            println!("{rendered}");
            Ok(())
        }
        _ => Err(ReportError::Configuration(format!(
            "unknown command '{command}'"
        ))),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = argv.first() else {
        return usage();
    };
    let args = match parse_flags(&argv[1..]) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            return usage();
        }
    };

    let config = Config::from_env();
    match run(command, args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
