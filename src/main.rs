use anyhow::Context;
use marketplace_settlement::{bootstrap, config, server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,marketplace_settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting Marketplace Settlement Service");

    let config = config::Config::from_env().context("invalid configuration")?;
    let bind_address = config.bind_address.clone();

    let state = bootstrap::initialize_app_state(config)
        .await
        .context("failed to initialize application state")?;

    // Create HTTP server
    let app = server::create_app(state);

    // Run the Server
    server::run_server(app, &bind_address).await?;

    Ok(())
}
