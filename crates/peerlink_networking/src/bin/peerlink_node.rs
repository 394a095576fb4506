//! # PEERLINK Node
//!
//! Interactive chat node: hosts or joins a session, sends stdin lines as CHAT
//! and prints what arrives.
//!
//! ## Usage
//!
//! ```bash
//! peerlink_node host --port 7777
//! peerlink_node join --addr 192.168.1.10:7777 --read-delay 100
//! ```

use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};
use peerlink_networking::{
    MessageBody, MessageKind, MessageSink, Session, SessionConfig, SessionEvent, SessionState, TickPacer,
    TransportStats,
};
use peerlink_shared::DEFAULT_PORT;
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer chat node", long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// TOML session configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run for N seconds then exit
    #[arg(long, global = true)]
    duration: Option<u64>,

    /// Artificial delay applied to received datagrams, in milliseconds
    #[arg(long, global = true)]
    read_delay: Option<u64>,

    /// Update rate in Hz
    #[arg(long, global = true, default_value_t = 60)]
    tick_rate: u32,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Host a new session as master
    Host {
        /// UDP port to bind
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Join the session hosted at ADDR
    Join {
        /// Address of the session master
        #[arg(short, long)]
        addr: SocketAddr,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("peerlink_node: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(delay) = args.read_delay {
        config.read_delay_ms = delay;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         PEERLINK NODE                                            ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("┌─ CONFIGURATION ─────────────────────────────────────────────────┐");
    match &args.mode {
        Mode::Host { port } => println!("│ Mode:               host on port {port}"),
        Mode::Join { addr } => println!("│ Mode:               join {addr}"),
    }
    println!("│ Reliable TTL:       {} ms", config.reliable_ttl_ms);
    println!("│ Peer Timeout:       {} ms", config.peer_timeout_ms);
    println!("│ Read Delay:         {} ms", config.read_delay_ms);
    println!("│ Packet Loss:        {}%", config.packet_loss_percent);
    match args.duration {
        Some(d) => println!("│ Duration:           {d} seconds"),
        None => println!("│ Duration:           infinite"),
    }
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let (events_tx, events) = unbounded::<SessionEvent>();
    let mut session = Session::new(config);
    session.register_handler(MessageKind::Chat, |message, _ctx| {
        if let MessageBody::Chat { text } = message.body() {
            println!("[{}] {}", message.sender(), text);
        }
    });

    match &args.mode {
        Mode::Host { port } => session.create_session(*port, events_tx)?,
        Mode::Join { addr } => session.connect_to_session(*addr, events_tx)?,
    }
    if let Some(addr) = session.local_addr() {
        println!("Listening on {addr}");
    }

    let lines = spawn_stdin_reader();
    let mut pacer = TickPacer::new(args.tick_rate);
    let start = Instant::now();
    let deadline = args.duration.map(Duration::from_secs);

    loop {
        if deadline.is_some_and(|d| start.elapsed() >= d) {
            break;
        }

        let mut finished = false;
        pacer.tick(|| {
            session.update();
            finished = report_events(&events);
            for text in lines.try_iter() {
                send_chat(&mut session, text);
            }
        });
        if finished || session.state() == SessionState::Disconnected {
            break;
        }
    }

    let transport = session.transport_stats().unwrap_or_default();
    session.disconnect();
    print_summary(transport, &pacer, start);
    Ok(())
}

/// Prints pending session events. Returns true once the session is over.
fn report_events(events: &Receiver<SessionEvent>) -> bool {
    let mut finished = false;
    for event in events.try_iter() {
        match event {
            SessionEvent::Connected => println!("* joined the session"),
            SessionEvent::JoinFailed(reason) => {
                println!("* join failed: {reason}");
                finished = true;
            }
            SessionEvent::Disconnected(reason) => {
                println!("* disconnected: {reason}");
                finished = true;
            }
            SessionEvent::PeerLeft { peer, reason } => println!("* {peer} left: {reason}"),
            SessionEvent::NewMaster { old, new } => println!("* master {old} gone, {new} took over"),
            SessionEvent::OwnershipMigrated { departed, report } => println!(
                "* {departed}'s entities: {} reassigned, {} destroyed",
                report.reassigned.len(),
                report.destroyed.len()
            ),
        }
    }
    finished
}

fn send_chat(session: &mut Session, text: String) {
    if text.is_empty() {
        return;
    }
    if session.state() != SessionState::Connected {
        println!("* not connected yet");
        return;
    }
    if let Err(e) = session.send_to_all(MessageBody::Chat { text }, true) {
        println!("* send failed: {e}");
    }
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    let reader = std::thread::Builder::new()
        .name("peerlink-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line.trim_end().to_owned()).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = reader {
        tracing::warn!("stdin reader unavailable: {}", e);
    }
    rx
}

fn print_summary(transport: TransportStats, pacer: &TickPacer, start: Instant) {
    let stats = pacer.stats();
    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                    NODE SHUTDOWN                                 ║");
    println!("╠══════════════════════════════════════════════════════════════════╣");
    println!("║ Uptime:             {:>10.1} s", start.elapsed().as_secs_f64());
    println!("║ Total Ticks:        {:>10}", pacer.tick_count());
    println!("║ Avg Tick Time:      {:>10} μs", stats.avg_tick_us);
    println!("║ Late Ticks:         {:>10}", stats.late_ticks);
    println!("║ Packets Sent:       {:>10}", transport.packets_sent);
    println!("║ Packets Received:   {:>10}", transport.packets_received);
    println!("╚══════════════════════════════════════════════════════════════════╝");
}
