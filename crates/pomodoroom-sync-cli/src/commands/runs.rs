use clap::Subcommand;

use super::common::{print_json, CliResult, Engine};

#[derive(Subcommand)]
pub enum RunsAction {
    /// Recent runs for an owner, newest first
    List {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// One run with its errors
    Show { run_id: String },
    /// Fail runs left `started` by a crashed process
    Abandon,
}

pub fn run(action: RunsAction) -> CliResult {
    let engine = Engine::open()?;
    let logger = engine.orchestrator.logger();
    match action {
        RunsAction::List { owner, limit } => {
            let runs = logger.history(&owner, limit)?;
            if runs.is_empty() {
                println!("no runs for {owner}");
                return Ok(());
            }
            for run in runs {
                println!(
                    "{}  {}  {:<9}  {:<13}  +{} ~{} -{}  errors={}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.run_id,
                    run.status.as_str(),
                    run.direction.as_str(),
                    run.items_created,
                    run.items_updated,
                    run.items_deleted,
                    run.errors.len()
                );
            }
        }
        RunsAction::Show { run_id } => match logger.get(&run_id)? {
            Some(run) => print_json(&run)?,
            None => return Err(format!("run not found: {run_id}").into()),
        },
        RunsAction::Abandon => {
            let abandoned = engine.orchestrator.abandon_expired()?;
            println!("abandoned {} run(s)", abandoned.len());
            for id in abandoned {
                println!("  {id}");
            }
        }
    }
    Ok(())
}
