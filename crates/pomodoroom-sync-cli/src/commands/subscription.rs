use chrono::{Duration, Utc};
use clap::Subcommand;
use pomodoroom_sync::storage::SubscriptionStore;
use pomodoroom_sync::sync::channel_token;

use super::common::{block_on, print_json, CliResult, Engine};

#[derive(Subcommand)]
pub enum SubscriptionAction {
    /// Open a push channel on a calendar
    Watch {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "primary")]
        calendar: String,
        /// Public callback URL. Defaults to webhook.callback_url
        #[arg(long)]
        address: Option<String>,
    },
    /// Subscriptions expiring within the given number of hours
    Expiring {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Forget a channel locally
    Remove { channel: String },
    /// Drop delivery records older than the given number of days
    Prune {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

pub fn run(action: SubscriptionAction) -> CliResult {
    let engine = Engine::open()?;
    let store = engine.db.subscriptions();
    match action {
        SubscriptionAction::Watch {
            owner,
            calendar,
            address,
        } => {
            let address = address.unwrap_or_else(|| engine.config.webhook.callback_url.clone());
            if address.is_empty() {
                return Err("no callback address: pass --address or set webhook.callback_url".into());
            }
            let channel_id = uuid::Uuid::new_v4().to_string();
            let token = channel_token(&engine.config.webhook.channel_secret, &channel_id);

            let subscription = block_on(engine.calendar.watch(
                &owner,
                &calendar,
                &channel_id,
                &address,
                &token,
            ))??;
            store.save(&subscription)?;
            tracing::info!(
                channel_id = %subscription.channel_id,
                expires_at = %subscription.expires_at,
                "webhook channel registered"
            );
            print_json(&subscription)?;
        }
        SubscriptionAction::Expiring { hours } => {
            let before = Utc::now() + Duration::hours(hours);
            print_json(&store.list_expiring(before)?)?;
        }
        SubscriptionAction::Remove { channel } => {
            if store.remove(&channel)? {
                println!("removed {channel}");
            } else {
                return Err(format!("no subscription for channel {channel}").into());
            }
        }
        SubscriptionAction::Prune { days } => {
            let removed = store.prune_deliveries(Utc::now() - Duration::days(days))?;
            println!("pruned {removed} delivery record(s)");
        }
    }
    Ok(())
}
