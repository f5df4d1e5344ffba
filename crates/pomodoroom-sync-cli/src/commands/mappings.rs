use chrono::{Duration, Utc};
use clap::Subcommand;
use pomodoroom_sync::{MappingStore, SyncDb};

use super::common::{parse_kind, print_json, CliResult};

#[derive(Subcommand)]
pub enum MappingsAction {
    /// All mappings for an owner and entity kind
    List {
        #[arg(long)]
        owner: String,
        /// task or calendar_event
        #[arg(long, default_value = "task")]
        kind: String,
    },
    /// Mappings not synced within the given number of hours
    Stale {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "task")]
        kind: String,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Unresolved remote id collisions
    Flagged {
        #[arg(long)]
        owner: String,
    },
    /// Mark a flagged collision as handled
    Resolve { id: i64 },
}

pub fn run(action: MappingsAction) -> CliResult {
    let store = SyncDb::open()?.mappings();
    match action {
        MappingsAction::List { owner, kind } => {
            print_json(&store.list(&owner, parse_kind(&kind)?)?)?;
        }
        MappingsAction::Stale { owner, kind, hours } => {
            let cutoff = Utc::now() - Duration::hours(hours);
            print_json(&store.list_stale(&owner, parse_kind(&kind)?, cutoff)?)?;
        }
        MappingsAction::Flagged { owner } => {
            print_json(&store.list_flagged(&owner)?)?;
        }
        MappingsAction::Resolve { id } => {
            if store.resolve_flag(id)? {
                println!("resolved {id}");
            } else {
                return Err(format!("no open collision with id {id}").into());
            }
        }
    }
    Ok(())
}
