//! Entry point for `netsnoop`.
//!
//! Parses CLI arguments and dispatches into either **coordinator** or
//! **agent** mode. All protocol work is delegated to library modules;
//! `main.rs` owns process setup (logging, argument parsing) and the
//! interactive console on the coordinator side.

use std::io::Write;
use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::{ArgAction, ArgGroup, Parser};
use tokio::sync::mpsc;

use netsnoop::command::parse_command;
use netsnoop::server::{Server, ServerEvent, ServerHandle};
use netsnoop::{client, Command, NetStat};

/// Distributed network-measurement harness.
#[derive(Parser)]
#[command(author, version, about)]
#[command(group(ArgGroup::new("role").required(true).args(["server", "client"])))]
#[command(after_help = "\
console commands (coordinator):
  ping count 10                  test round-trip delay
  send count 1000                test one-way throughput
  send count 1000 multicast      same, over the multicast group
  send speed 500 time 3000       target 500 KB/s for 3 s
  peers 2                        wait until two agents are connected
  sleep 5                        pause the script for five seconds")]
struct Cli {
    /// Run the coordinator, binding this address.
    #[arg(short = 's', value_name = "BIND_IP")]
    server: Option<IpAddr>,

    /// Run an agent, connecting to this coordinator.
    #[arg(short = 'c', value_name = "SERVER_IP")]
    client: Option<IpAddr>,

    /// Control-channel TCP port.
    #[arg(value_name = "PORT", default_value_t = 4000)]
    port: u16,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -v flags pick the default; RUST_LOG still wins when set.
    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match (cli.server, cli.client) {
        (Some(bind_ip), _) => run_coordinator(bind_ip, cli.port).await,
        (_, Some(server_ip)) => client::run(server_ip, cli.port).await,
        _ => unreachable!("clap enforces the role group"),
    }
}

/// Run the coordinator plus its interactive console until stdin closes.
async fn run_coordinator(bind_ip: IpAddr, port: u16) -> Result<()> {
    let (server, handle) = Server::bind(bind_ip, port).await?;
    let ServerHandle { commands, mut events, mut peer_count, local_addr: _ } = handle;
    let mut server_task = tokio::spawn(server.run());

    // Printer: narrates peer traffic, hands command completions back to the
    // console loop.
    let (done_tx, mut done_rx) = mpsc::channel::<(Command, Option<NetStat>)>(4);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::PeerConnected { cookie, peers } => {
                    eprintln!("peer connect({peers}): {cookie}");
                }
                ServerEvent::PeerDisconnected { cookie, peers } => {
                    eprintln!("peer disconnect({peers}): {cookie}");
                }
                ServerEvent::PeerStopped { cookie, stat } => {
                    println!("peer finish: ({cookie}) || {}", render(&stat));
                }
                ServerEvent::CommandFinished { command, stat } => {
                    let _ = done_tx.send((command, stat)).await;
                }
            }
        }
    });

    // Console thread: blocking stdin reads, pushed into the command queue.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(4);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if line_tx.blocking_send(line.trim().to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        print!("command:");
        std::io::stdout().flush().context("flushing prompt")?;

        let line = tokio::select! {
            // surface bind/accept failures instead of waiting at the prompt
            finished = &mut server_task => return finished?,
            maybe = line_rx.recv() => match maybe {
                None => break, // stdin EOF: clean shutdown
                Some(line) => line,
            },
        };
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("peers ") {
            let Ok(wanted) = rest.trim().parse::<usize>() else {
                eprintln!("command format error: {line}");
                continue;
            };
            eprintln!("wait {wanted} peers.");
            while *peer_count.borrow_and_update() < wanted {
                if peer_count.changed().await.is_err() {
                    break;
                }
            }
            eprintln!("connect {wanted} peers.");
            continue;
        }
        if let Some(rest) = line.strip_prefix("sleep ") {
            let Ok(seconds) = rest.trim().parse::<u64>() else {
                eprintln!("command format error: {line}");
                continue;
            };
            tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
            continue;
        }

        match parse_command(&line) {
            Ok(command @ (Command::Ping(_) | Command::Send(_))) => {
                if commands.send(command).await.is_err() {
                    break; // server is gone; its error surfaces below
                }
                match done_rx.recv().await {
                    Some((command, stat)) => {
                        println!("command finish: {command} || {}", render(&stat));
                    }
                    None => break,
                }
            }
            Ok(_) => eprintln!("command '{line}' is not supported here."),
            Err(e) => eprintln!("command '{line}' rejected: {e}"),
        }
        println!();
    }

    drop(commands);
    server_task.await.context("joining server task")?
}

fn render(stat: &Option<NetStat>) -> String {
    match stat {
        Some(stat) => stat.to_string(),
        None => "NULL".to_string(),
    }
}
