mod cli;

#[tokio::main]
async fn main() {
    // The core logs through `log`; the fmt subscriber's log bridge
    // collects both.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = cli::run().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
