use clap::Parser;
use tracing::error;

use spirit::{Migration, Runner};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let migration = Migration::parse();
    let code = match Runner::new(migration) {
        Ok(mut runner) => match runner.run().await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "migration failed");
                e.exit_code()
            }
        },
        Err(e) => {
            error!(error = %e, "invalid migration request");
            e.exit_code()
        }
    };
    std::process::exit(code);
}
