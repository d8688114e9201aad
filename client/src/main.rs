use clap::{ArgGroup, Parser};
use client::input::TypingBot;
use client::network::{Client, ClientOptions, KeySource, RoomTarget};
use log::info;
use shared::{RaceError, RoomCode};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("target").required(true).args(["room", "create"])))]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name shown to the other racers
    #[arg(short = 'n', long, default_value = "racer")]
    name: String,

    /// Code of the room to join
    #[arg(short = 'r', long)]
    room: Option<String>,

    /// Create a room racing on this text
    #[arg(long)]
    create: Option<String>,

    /// Capacity of a created room
    #[arg(short = 'c', long, default_value = "2")]
    capacity: u8,

    /// Start the countdown once this many racers are in the room
    #[arg(long)]
    start_when: Option<usize>,

    /// Let a bot type at this speed instead of reading stdin
    #[arg(long)]
    bot_wpm: Option<f64>,

    /// Chance per character that the bot makes a mistake
    #[arg(long, default_value = "0.0")]
    error_rate: f64,

    /// Milliseconds before an unacknowledged keystroke is resent
    #[arg(long, default_value = "200")]
    resend_timeout: u64,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,
}

impl Args {
    fn into_options(self) -> Result<ClientOptions, RaceError> {
        let target = match self.room {
            Some(code) => RoomTarget::Join(RoomCode::parse(&code)?),
            None => RoomTarget::Create {
                text: self.create.unwrap_or_default(),
                capacity: self.capacity,
            },
        };
        let source = match self.bot_wpm {
            Some(wpm) => KeySource::Bot(TypingBot::new(wpm, self.error_rate)),
            None => KeySource::Stdin,
        };

        Ok(ClientOptions {
            server: self.server,
            display_name: self.name,
            target,
            source,
            start_when: self.start_when,
            resend_timeout: Duration::from_millis(self.resend_timeout.max(1)),
            fake_ping_ms: self.fake_ping,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let options = Args::parse().into_options()?;

    info!("Starting client...");
    info!("Connecting to: {}", options.server);
    if options.fake_ping_ms > 0 {
        info!("Simulating {}ms latency", options.fake_ping_ms);
    }
    if options.source == KeySource::Stdin {
        info!("Type the text, pressing Enter after each word");
    }

    let mut client = Client::new(options).await?;
    client.run().await?;

    Ok(())
}
