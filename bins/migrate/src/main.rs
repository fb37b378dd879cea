mod cmd;

use clap::Parser;
use cmd::config::{Effective, MigrateArgs};
use cmd::run::Outcome;

#[derive(Parser)]
#[command(name = "kv-migrate", about = "Миграция схемы hash-записей Redis (rollout / rollback 2.1.0)")]
struct Cli {
    #[command(flatten)]
    args: MigrateArgs,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let eff = match Effective::new(&cli.args) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match cmd::run::run(&eff).await {
        Ok(summary) => {
            let outcome = Outcome::of(&summary);
            if outcome == Outcome::Interrupted {
                eprintln!("KeyboardInterrupt");
            }
            std::process::exit(outcome.exit_code());
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
