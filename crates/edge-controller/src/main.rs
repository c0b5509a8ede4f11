use clap::Parser;

use edge_controller::config::{AppConfig, Cli, Command};

#[tokio::main]
async fn main() -> edge_controller::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let config = AppConfig::resolve(args)?;
            edge_controller::init_tracing(config.debug);
            tracing::info!(name = %config.name, "edge controller starting");
            edge_controller::run(config).await
        }
    }
}
