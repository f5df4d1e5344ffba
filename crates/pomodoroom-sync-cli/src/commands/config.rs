use clap::Subcommand;
use pomodoroom_sync::SyncConfig;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key (e.g. "lease.ttl_secs", "webhook.callback_url")
        key: String,
    },
    /// Set a config value
    Set {
        /// Config key
        key: String,
        /// New value
        value: String,
    },
    /// List all config values
    List,
    /// Reset config to defaults
    Reset,
}

pub fn run(action: ConfigAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ConfigAction::Get { key } => {
            let config = SyncConfig::load_or_default();
            match config.get(&key) {
                Some(value) => println!("{value}"),
                None => {
                    eprintln!("unknown key: {key}");
                    std::process::exit(1);
                }
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = SyncConfig::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("ok");
        }
        ConfigAction::List => {
            let config = SyncConfig::load_or_default();
            let text = toml::to_string_pretty(&config)?;
            println!("{text}");
        }
        ConfigAction::Reset => {
            let config = SyncConfig::default();
            config.save()?;
            println!("config reset to defaults");
        }
    }
    Ok(())
}
