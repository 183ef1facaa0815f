use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use rapport::config;
use rapport::engine::SocialEngine;
use rapport::store::KvStore;
use rapport::store::redis::RedisStore;

#[derive(Parser)]
#[command(name = "rapport")]
#[command(about = "Per-group social state engine for chat bots")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the assembled prompt fragments for a group
    Prompt {
        /// Group id
        #[arg(short, long)]
        group: String,

        /// User id; include the per-user memory fragment
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Clear stored memory for a user, or the group record itself
    Clear {
        /// Group id
        #[arg(short, long)]
        group: String,

        /// User id; clears the user record instead of the group's
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show engine status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::load()?;

    match cli.command {
        Commands::Prompt { group, user } => {
            let store: Arc<dyn KvStore> =
                Arc::new(RedisStore::connect(&config.store.url).await?);
            let engine = SocialEngine::new(store, &config);

            let output = match user {
                Some(user) => engine.prompt_for(&group, &user).await,
                None => {
                    let fragments = [
                        engine.affect.prompt_for_group(&group).await,
                        engine.expression.prompt_for_group(&group).await,
                        engine.group_memory.prompt_for(&group).await,
                    ];
                    fragments
                        .iter()
                        .filter(|fragment| !fragment.is_empty())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("\n\n")
                }
            };
            println!("{output}");
            Ok(())
        }

        Commands::Clear { group, user } => {
            let store: Arc<dyn KvStore> =
                Arc::new(RedisStore::connect(&config.store.url).await?);
            let engine = SocialEngine::new(store, &config);

            match user {
                Some(user) => engine.user_memory.clear(&group, &user).await,
                None => engine.group_memory.clear(&group).await,
            }
            println!("cleared");
            Ok(())
        }

        Commands::Status => {
            println!("rapport v{}", env!("CARGO_PKG_VERSION"));
            println!("store: {}", config.store.url);
            println!(
                "ai extraction: {}",
                if config.extraction.port().is_some() {
                    "configured"
                } else {
                    "disabled"
                }
            );
            Ok(())
        }
    }
}
