use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use storage::{CounterStore, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/occupancy.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the persisted count.
    Show,
    /// Zero the persisted count.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Show => {
            let count = storage.get().await?;
            println!("count={count}");
        }
        Command::Reset { yes } => {
            if !yes {
                bail!("refusing to reset {} without --yes", cli.database_url);
            }
            let before = storage.get().await?;
            let count = storage.reset().await?;
            println!("reset count {before} -> {count}");
        }
    }

    storage.close().await;
    Ok(())
}
