use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{ClientEvent, CountView, CounterClient, HttpCounterRemote, Intent};
use shared::domain::{Capacity, DEFAULT_AMOUNT, DEFAULT_MAX_CAPACITY};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::broadcast,
};
use tracing_subscriber::EnvFilter;

const METER_WIDTH: usize = 20;

#[derive(Parser, Debug)]
#[command(about = "Track how many people are inside a venue")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long, default_value_t = DEFAULT_MAX_CAPACITY)]
    max_capacity: u64,
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current count.
    Get,
    /// Record people entering.
    Inc {
        #[arg(default_value_t = DEFAULT_AMOUNT)]
        amount: u64,
    },
    /// Record people leaving.
    Dec {
        #[arg(default_value_t = DEFAULT_AMOUNT)]
        amount: u64,
    },
    /// Set the count back to zero.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Print counts pushed by the server as they change.
    Watch,
    /// Interactive session.
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let remote = HttpCounterRemote::with_timeout(
        &args.server_url,
        Duration::from_millis(args.timeout_ms.max(1)),
    )?;
    let mut client = CounterClient::new(remote, Capacity::new(args.max_capacity));

    match args.command {
        Command::Get => {
            client.refresh().await?;
            print_view(&client.view());
        }
        Command::Inc { amount } => {
            client.increase(amount).await?;
            print_view(&client.view());
        }
        Command::Dec { amount } => {
            client.decrease(amount).await?;
            print_view(&client.view());
        }
        Command::Reset { yes } => {
            client.request_reset();
            if !yes && !ask("Reset the count to 0? [y/N] ").await? {
                client.cancel_reset();
                println!("Reset cancelled.");
                return Ok(());
            }
            client.confirm_reset().await?;
            print_view(&client.view());
        }
        Command::Watch => watch(client).await?,
        Command::Shell => shell(client).await?,
    }

    Ok(())
}

async fn watch(mut client: CounterClient<HttpCounterRemote>) -> Result<()> {
    client.refresh().await?;
    print_view(&client.view());

    let mut subscription = client.remote().subscribe().await?;
    while let Some(event) = subscription.next().await {
        client.apply_server_event(&event?);
        print_view(&client.view());
    }
    bail!("server closed the event stream")
}

async fn shell(mut client: CounterClient<HttpCounterRemote>) -> Result<()> {
    let mut events = client.subscribe_events();
    if client.refresh().await.is_ok() {
        print_view(&client.view());
    }
    print_messages(&mut events);

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        prompt(if client.reset_pending() {
            "confirm reset? (confirm/cancel)> "
        } else {
            "> "
        })
        .await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit" | "q") {
            break;
        }

        let intent = match line.parse::<Intent>() {
            Ok(intent) => intent,
            Err(err) => {
                println!("{err}; try +N, -N, refresh, reset, confirm, cancel or quit");
                continue;
            }
        };

        match intent {
            Intent::RequestReset => {
                client.request_reset();
                println!("Are you sure you want to reset the count to 0?");
            }
            Intent::CancelReset => {
                if client.cancel_reset() {
                    println!("Reset cancelled.");
                }
            }
            Intent::ConfirmReset if !client.reset_pending() => {
                println!("Nothing to confirm; type 'reset' first.");
            }
            intent => {
                // Failures are reported through the event stream below.
                let succeeded = client.dispatch(intent).await.is_ok();
                print_messages(&mut events);
                if succeeded {
                    print_view(&client.view());
                }
                continue;
            }
        }
        print_messages(&mut events);
    }
    Ok(())
}

fn print_messages(events: &mut broadcast::Receiver<ClientEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::Notice(message) => println!("{message}"),
            ClientEvent::Error(message) => eprintln!("{message}"),
            ClientEvent::CountUpdated { .. } => {}
        }
    }
}

fn print_view(view: &CountView) {
    println!("{}", render_view(view));
}

fn render_view(view: &CountView) -> String {
    let filled = (view.meter_fraction * METER_WIDTH as f64).round() as usize;
    let filled = filled.min(METER_WIDTH);
    format!(
        "{count} / {capacity} [{bar}{gap}] {percent:>3}% {class}",
        count = view.count,
        capacity = view.capacity,
        bar = "#".repeat(filled),
        gap = ".".repeat(METER_WIDTH - filled),
        percent = Capacity::new(view.capacity).meter_percent(view.count),
        class = view.classification,
    )
}

async fn prompt(text: &str) -> Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn ask(question: &str) -> Result<bool> {
    prompt(question).await?;
    let mut answer = String::new();
    BufReader::new(io::stdin()).read_line(&mut answer).await?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::CapacityClassification;

    fn view(count: u64) -> CountView {
        let capacity = Capacity::default();
        CountView {
            count,
            capacity: capacity.max(),
            classification: capacity.classify(count),
            meter_fraction: capacity.meter_fraction(count),
        }
    }

    #[test]
    fn meter_renders_fraction_of_capacity() {
        let line = render_view(&view(125));
        assert_eq!(line, "125 / 250 [##########..........]  50% warning");
    }

    #[test]
    fn meter_stays_full_past_capacity() {
        let line = render_view(&view(400));
        assert!(line.starts_with("400 / 250 [####################] 100%"));
        assert_eq!(view(400).classification, CapacityClassification::Critical);
    }
}
