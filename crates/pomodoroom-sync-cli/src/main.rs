use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod server;


#[derive(Parser)]
#[command(name = "pomodoroom-sync", version, about = "Pomodoroom calendar/task sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync now
    Run(commands::run::RunArgs),
    /// Sync run history
    Runs {
        #[command(subcommand)]
        action: commands::runs::RunsAction,
    },
    /// Inspect local/remote mappings
    Mappings {
        #[command(subcommand)]
        action: commands::mappings::MappingsAction,
    },
    /// Manage webhook channel subscriptions
    Subscription {
        #[command(subcommand)]
        action: commands::subscription::SubscriptionAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Serve the trigger API and webhook endpoint
    Serve(commands::serve::ServeArgs),
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "pomodoroom_sync=info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Runs { action } => commands::runs::run(action),
        Commands::Mappings { action } => commands::mappings::run(action),
        Commands::Subscription { action } => commands::subscription::run(action),
        Commands::Config { action } => commands::config::run(action),
        Commands::Serve(args) => commands::serve::run(args),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
