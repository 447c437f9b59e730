//! duocall - Two-party call negotiation demo

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duocall::call::{CallEvent, Endpoint, EndpointHandle, EndpointStatus};
use duocall::config::{CallConfig, DEFAULT_RELAY_URL, DEFAULT_ROOM_ID};
use duocall::media::FakeMediaDevices;
use duocall::protocol::{NegotiationRole, ParticipantId};
use duocall::signaling::{RelayServer, SignalingClient};
use duocall::transport::{LoopbackFactory, TransportState};

#[derive(Parser)]
#[command(name = "duocall")]
#[command(about = "Two-party call negotiation over a WebSocket relay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Negotiate a call between two local endpoints through an in-process relay
    Loopback {
        /// Room both endpoints join
        #[arg(short, long, default_value = DEFAULT_ROOM_ID)]
        room: String,

        /// Seconds to wait for both remote streams
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// Join a room on a relay server as a simulated endpoint
    Join {
        /// Relay server URL (e.g., ws://127.0.0.1:3000)
        #[arg(short, long, env = "DUOCALL_RELAY", default_value = DEFAULT_RELAY_URL)]
        server: String,

        /// Room to join
        #[arg(short, long, env = "DUOCALL_ROOM", default_value = DEFAULT_ROOM_ID)]
        room: String,

        /// Send the offer as soon as local media is ready
        #[arg(long)]
        offer: bool,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn spawn_endpoint(config: &CallConfig) -> EndpointHandle {
    Endpoint::spawn(
        config.clone(),
        ParticipantId::generate(),
        SignalingClient::new(&config.relay_url),
        Arc::new(FakeMediaDevices::new()),
        Arc::new(LoopbackFactory),
    )
}

/// Wait until the relay has acknowledged the endpoint's join
async fn wait_acknowledged(endpoint: &EndpointHandle, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !endpoint.status().await?.acknowledged {
        if tokio::time::Instant::now() >= deadline {
            bail!("Relay did not acknowledge join of {}", endpoint.participant_id());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Wait for the next remote stream notification
async fn wait_remote_stream(events: &mut broadcast::Receiver<CallEvent>) -> Result<String> {
    loop {
        match events.recv().await {
            Ok(CallEvent::RemoteStreamReady { url }) => return Ok(url),
            Ok(CallEvent::CallFailed { reason }) => bail!("Call failed: {}", reason),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("Endpoint stopped"),
        }
    }
}

fn print_status(label: &str, status: &EndpointStatus) {
    let state = |s: Option<TransportState>| {
        s.map_or_else(|| "-".to_string(), |s| format!("{:?}", s))
    };

    println!("\n {} ({})", label, status.participant_id);
    println!("   Room:          {}", status.room_id);
    println!("   Joined:        {}", status.joined);
    println!(
        "   Local stream:  {}",
        status.local_stream.as_deref().unwrap_or("-")
    );
    println!(
        "   Remote stream: {}",
        status.remote_stream.as_deref().unwrap_or("-")
    );
    println!("   Initiator:     {}", state(status.initiator));
    println!("   Responder:     {}", state(status.responder));
    println!("   Muted:         {}", status.muted);
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::LocalStreamReady { url } => println!("Local stream ready: {}", url),
        CallEvent::RemoteStreamReady { url } => println!("Remote stream ready: {}", url),
        CallEvent::StreamsClosed => println!("Streams closed"),
        CallEvent::MuteChanged { muted } => {
            println!("{}", if *muted { "Muted" } else { "Unmuted" })
        }
        CallEvent::CameraSwitched { facing } => println!("Camera switched to {:?}", facing),
        CallEvent::CallFailed { reason } => println!("Call failed: {}", reason),
    }
}

async fn run_loopback(room: String, timeout_secs: u64) -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = RelayServer::new();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            warn!("Relay server stopped: {}", e);
        }
    });
    info!("In-process relay on {}", addr);

    let config = CallConfig::new(&format!("ws://{}", addr), &room);
    let timeout = Duration::from_secs(timeout_secs);

    let caller = spawn_endpoint(&config);
    let callee = spawn_endpoint(&config);
    let mut caller_events = caller.subscribe();
    let mut callee_events = callee.subscribe();

    caller.start_local().await?;
    callee.start_local().await?;
    wait_acknowledged(&caller, timeout).await?;
    wait_acknowledged(&callee, timeout).await?;

    callee.start_call(NegotiationRole::Responder).await?;
    caller.start_call(NegotiationRole::Initiator).await?;

    let streams = tokio::time::timeout(timeout, async {
        let caller_remote = wait_remote_stream(&mut caller_events).await?;
        let callee_remote = wait_remote_stream(&mut callee_events).await?;
        Ok::<_, anyhow::Error>((caller_remote, callee_remote))
    })
    .await;

    let result = match streams {
        Ok(Ok((caller_remote, callee_remote))) => {
            println!("\nCall established");
            println!("  caller sees {}", caller_remote);
            println!("  callee sees {}", callee_remote);
            print_status("Caller", &caller.status().await?);
            print_status("Callee", &callee.status().await?);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!(
            "Call not established within {} seconds",
            timeout_secs
        )),
    };

    caller.end_call().await?;
    callee.end_call().await?;
    caller.shutdown().await;
    callee.shutdown().await;
    server_task.abort();

    result
}

async fn run_join(server: String, room: String, offer: bool) -> Result<()> {
    let config = CallConfig::new(&server, &room);
    let endpoint = spawn_endpoint(&config);
    let mut events = endpoint.subscribe();

    info!(
        "Joining room {} on {} as {}",
        room,
        server,
        endpoint.participant_id()
    );
    endpoint.start_local().await?;

    if offer {
        endpoint.start_call(NegotiationRole::Initiator).await?;
    }

    println!("\nCommands: start, call, answer, hangup, mute, switch, status, quit");
    println!("Press Ctrl+C to exit.\n");

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} call events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            line_result = stdin_reader.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        if !handle_command(&endpoint, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                    }
                }
            }
        }
    }

    endpoint.shutdown().await;
    Ok(())
}

/// Run one interactive command; returns false to quit
async fn handle_command(endpoint: &EndpointHandle, line: &str) -> bool {
    let result = match line {
        "" => Ok(()),
        "start" => endpoint.start_local().await.map(|_| ()),
        "call" => endpoint.start_call(NegotiationRole::Initiator).await,
        "answer" => endpoint.start_call(NegotiationRole::Responder).await,
        "hangup" => endpoint.end_call().await.map(|_| ()),
        "mute" => match endpoint.toggle_mute().await {
            Ok(None) => {
                println!("Nothing to mute until the remote stream arrives");
                Ok(())
            }
            other => other.map(|_| ()),
        },
        "switch" => endpoint.switch_camera().await.map(|_| ()),
        "status" => endpoint.status().await.map(|s| print_status("Endpoint", &s)),
        "quit" | "exit" => return false,
        other => {
            println!("Unknown command: {}", other);
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("{} failed: {}", line, e);
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Loopback { room, timeout } => {
            run_loopback(room, timeout).await?;
        }
        Commands::Join {
            server,
            room,
            offer,
        } => {
            run_join(server, room, offer).await?;
        }
    }

    Ok(())
}
