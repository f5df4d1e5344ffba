//! Wiring shared by the subcommands.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pomodoroom_sync::provider::{
    EnvTokenProvider, GoogleCalendarAdapter, GoogleClient, GoogleTasksAdapter,
};
use pomodoroom_sync::{EntityKind, SyncConfig, SyncDb, SyncOrchestrator};

pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Everything a command needs to talk to the database and the provider.
pub struct Engine {
    pub config: SyncConfig,
    pub db: SyncDb,
    pub calendar: Arc<GoogleCalendarAdapter>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Engine {
    pub fn open() -> CliResult<Self> {
        let config = SyncConfig::load()?;
        let db = SyncDb::open()?;
        Self::with(config, db)
    }

    pub fn with(config: SyncConfig, db: SyncDb) -> CliResult<Self> {
        let client = GoogleClient::new(
            Arc::new(EnvTokenProvider::new(config.provider.access_token_env.clone())),
            Duration::from_secs(config.provider.request_timeout_secs),
        )?;
        let calendar = Arc::new(GoogleCalendarAdapter::from_config(
            client.clone(),
            &config.provider,
        ));
        let tasks = Arc::new(GoogleTasksAdapter::from_config(client, &config.provider));
        let orchestrator = SyncOrchestrator::new(db.clone(), &config)
            .with_adapter(calendar.clone())
            .with_adapter(tasks);

        Ok(Self {
            config,
            db,
            calendar,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

pub fn block_on<F: Future>(fut: F) -> CliResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(fut))
}

pub fn parse_kind(raw: &str) -> CliResult<EntityKind> {
    Ok(raw.parse::<EntityKind>()?)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
