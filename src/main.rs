use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

mod chat;
mod config;
mod guard;
mod server;
mod session;
mod settings;
mod storage;
mod templates;
mod ui;

use chat::client::ChatClient;
use guard::provider::HttpIdentityProvider;
use guard::{Gate, MatcherVariant, RouteMatcher};
use storage::SqliteChatRepository;
use ui::{Branding, BrandingPreset};

#[derive(Debug, Parser)]
#[command(name = "medassist")]
#[command(about = "Signed-in chat front end for a clinic assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        /// Overrides the configured branding preset
        #[arg(long, value_enum)]
        branding: Option<BrandingPreset>,
        /// Which paths skip the session check
        #[arg(long, value_enum)]
        matcher: Option<MatcherVariant>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start {
            listen,
            branding,
            matcher,
        } => {
            let addr: SocketAddr = listen.parse()?;
            let mut config = config::Config::from_env();
            if let Some(b) = branding {
                config.branding = b;
            }
            if let Some(m) = matcher {
                config.matcher = m;
            }
            config.validate()?;
            tracing::info!(
                upstream = %config.upstream_url,
                auth = %config.auth_url,
                matcher = ?config.matcher,
                "starting"
            );

            let provider = HttpIdentityProvider::new(
                config.auth_url.clone(),
                config.auth_anon_key.clone(),
                config.cookie_prefix.clone(),
            );
            let gate = Gate {
                provider: Arc::new(provider),
                matcher: RouteMatcher::new(config.matcher)?,
                sign_in_path: config.sign_in_path.clone(),
            };
            let repo = SqliteChatRepository::initialize(config.database_url.clone()).await?;
            let state = server::AppState::new(
                Arc::new(repo),
                ChatClient::new(config.upstream_url.clone()),
                Branding::from_preset(config.branding),
            )?;
            server::serve(addr, state, gate).await?;
        }
    }
    Ok(())
}
