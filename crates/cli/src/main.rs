//! Huddle CLI
//!
//! Logs in to the chat server's real-time websocket as a user, subscribes to
//! scopes, and prints every inbound event until interrupted.

mod config;
mod logging;
mod paths;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use huddle_protocol::Envelope;
use huddle_realtime::{
    start_periodic_sync, ManagerOptions, SagaRunner, TransportOptions, WebsocketManager,
    WsTransport, SYNC_INTERVAL,
};
use tracing::info;

use crate::config::{ConnectionArgs, Settings};
use crate::logging::LogArgs;

#[derive(Debug, Parser)]
#[command(name = "huddle", version, about = "Follow a chat server's real-time events")]
struct Cli {
    /// Data directory (logs, default config)
    #[arg(long, global = true, env = "HUDDLE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true, env = "HUDDLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    logging: LogArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Connect and print events (default)
    Listen,
    /// Print the websocket URL that would be used
    Url,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    paths::init_data_dir(cli.data_dir.as_deref());

    let file = config::load_config(cli.config.as_deref())?;
    let settings = Settings::resolve(&cli.connection, file)?;

    match cli.command.unwrap_or(Command::Listen) {
        Command::Url => {
            println!("{}", settings.connection.connection_url()?);
            Ok(())
        }
        Command::Listen => {
            let logging = logging::init_logging(&cli.logging)?;
            eprintln!(
                "{} {}",
                style("logging to").dim(),
                logging.log_path.display()
            );
            info!(
                component = "cli",
                event = "cli.started",
                user_id = %settings.user_id,
                scopes = ?settings.scopes,
                "Starting huddle listener"
            );
            listen(settings).await
        }
    }
}

async fn listen(settings: Settings) -> anyhow::Result<()> {
    let user_id = settings.require_user()?.to_string();

    let (transport, events) =
        WsTransport::new(&settings.connection, TransportOptions::default())?;
    eprintln!(
        "{} {}",
        style("connecting").dim(),
        style(transport.url()).underlined()
    );

    let manager = Arc::new(WebsocketManager::with_options(
        Arc::new(transport),
        ManagerOptions {
            resubscribe_on_reconnect: settings.resubscribe_on_reconnect,
            ..Default::default()
        },
    ));
    let event_loop = manager.spawn_event_loop(events);

    let json_output = settings.json_output;
    let _printer = manager.use_websocket(Arc::new(move |envelope: &Envelope| {
        print_envelope(envelope, json_output)
    }));
    manager.register_reconnect_handler(
        "cli",
        Arc::new(|| eprintln!("{}", style("resynced after reconnect").yellow())),
    );

    let runner = SagaRunner::new();
    let _sync = start_periodic_sync(&runner, Arc::clone(&manager), SYNC_INTERVAL);

    manager.set_current_user_id(&user_id);
    manager.subscribe_to_scopes(settings.scopes.iter().cloned());

    tokio::signal::ctrl_c().await?;

    info!(
        component = "cli",
        event = "cli.shutdown",
        status = ?manager.status(),
        "Shutting down"
    );
    runner.cancel_all();
    manager.set_current_user_id("");
    event_loop.abort();
    Ok(())
}

fn print_envelope(envelope: &Envelope, json_output: bool) {
    if json_output {
        match serde_json::to_string(envelope) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("{} {e}", style("unprintable event:").red()),
        }
        return;
    }

    let target = [
        ("team", &envelope.broadcast.team_id),
        ("channel", &envelope.broadcast.channel_id),
        ("user", &envelope.broadcast.user_id),
    ]
    .iter()
    .filter(|(_, id)| !id.is_empty())
    .map(|(kind, id)| format!("{kind}:{id}"))
    .collect::<Vec<_>>()
    .join(" ");

    println!(
        "{} {} {} {}",
        style(format!("#{}", envelope.seq)).dim(),
        style(&envelope.event).cyan().bold(),
        style(target).dim(),
        envelope.data
    );
}
