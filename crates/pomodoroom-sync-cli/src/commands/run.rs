//! `run`: execute one sync and print its summary.

use chrono::{DateTime, Duration, Utc};
use clap::Args;
use pomodoroom_sync::{Direction, SyncRequest, SyncScope};

use super::common::{block_on, print_json, CliResult, Engine};

#[derive(Args)]
pub struct RunArgs {
    /// Owner whose data is synced
    #[arg(long)]
    pub owner: String,
    /// to_remote, from_remote or bidirectional
    #[arg(long, default_value = "bidirectional")]
    pub direction: String,
    /// Calendar to sync (time-window scope)
    #[arg(long, conflicts_with = "task_list")]
    pub calendar: Option<String>,
    /// Window start (RFC3339). Defaults to now minus webhook.lookback_hours
    #[arg(long, requires = "calendar")]
    pub from: Option<String>,
    /// Window end (RFC3339). Defaults to now plus webhook.lookahead_days
    #[arg(long, requires = "calendar")]
    pub to: Option<String>,
    /// Task list to sync
    #[arg(long)]
    pub task_list: Option<String>,
}

fn parse_time(flag: &str, raw: &str) -> CliResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid --{flag} '{raw}': {e}").into())
}

pub fn build_request(args: &RunArgs, lookback_hours: u32, lookahead_days: u32) -> CliResult<SyncRequest> {
    let direction: Direction = args.direction.parse()?;
    let scope = match (&args.calendar, &args.task_list) {
        (Some(calendar_id), None) => {
            let now = Utc::now();
            let start = match &args.from {
                Some(raw) => parse_time("from", raw)?,
                None => now - Duration::hours(i64::from(lookback_hours)),
            };
            let end = match &args.to {
                Some(raw) => parse_time("to", raw)?,
                None => now + Duration::days(i64::from(lookahead_days)),
            };
            if end <= start {
                return Err("--to must be after --from".into());
            }
            SyncScope::TimeWindow {
                calendar_id: calendar_id.clone(),
                start,
                end,
            }
        }
        (None, Some(list_id)) => SyncScope::TaskList {
            list_id: list_id.clone(),
        },
        _ => return Err("pass exactly one of --calendar or --task-list".into()),
    };
    Ok(SyncRequest::manual(args.owner.clone(), direction, scope))
}

pub fn run(args: RunArgs) -> CliResult {
    let engine = Engine::open()?;
    let request = build_request(
        &args,
        engine.config.webhook.lookback_hours,
        engine.config.webhook.lookahead_days,
    )?;

    let run = block_on(engine.orchestrator.run(&request))??;
    print_json(&run.summary())?;
    if !run.summary().success {
        std::process::exit(2);
    }
    Ok(())
}
