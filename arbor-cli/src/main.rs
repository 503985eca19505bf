use anyhow::Result;
use clap::{Parser, Subcommand};

use arbor_cli::{app, telemetry};
use arbor_config::load_config;

#[derive(Parser)]
#[command(author, version, about = "Arbor trading-bot broker")]
struct Cli {
    /// Environment name selecting `config/{env}.toml` overrides.
    #[arg(long)]
    env: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker (default).
    Serve,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.env.as_deref())?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            telemetry::init_tracing(&config.log_level, config.log_path.as_deref())?;
            app::run(config).await
        }
        Command::CheckConfig => {
            for user in &config.users {
                user.key_bytes()?;
                user.secret_bytes()?;
            }
            println!(
                "configuration ok: {} engine(s), {} adapter(s), {} user(s)",
                config.engines.len(),
                config.adapters.len(),
                config.users.len()
            );
            Ok(())
        }
    }
}
