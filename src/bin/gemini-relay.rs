use clap::Parser;

#[derive(Parser)]
#[command(
    name = "gemini-relay",
    about = "Key-balancing reverse proxy for Gemini-style upstreams"
)]
struct Args {
    /// Path to the TOML configuration file.
    config: std::path::PathBuf,
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,
    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = gemini_relay::RelayConfig::from_path(&args.config)?;
    let key_check_enabled = config.key_check.enabled;
    let state = gemini_relay::http::AppState::new(config)?;
    if key_check_enabled {
        gemini_relay::scheduler::spawn_key_checker(state.clone());
    }

    let app = gemini_relay::http::router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen = %args.listen, "gemini-relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}
