//! Entry point for `sim-tcp`.
//!
//! Runs one bulk transfer between two simulated nodes and reports whether the
//! stream arrived intact.  All protocol work is delegated to the library;
//! `main.rs` owns only process setup (logging, argument parsing) and the
//! driving loop.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use sim_tcp::{Config, Simulator, SimulatorConfig, SocketId};

const CLIENT: u16 = 1;
const SERVER: u16 = 2;
const SERVER_PORT: u16 = 80;
const CLIENT_PORT: u16 = 4000;

/// Reliable transfer over a simulated lossy network.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Bytes to transfer.
    #[arg(short, long, default_value_t = 100_000)]
    bytes: usize,
    /// Maximum segment payload.
    #[arg(long, default_value_t = 1000)]
    mss: usize,
    /// Send and receive buffer capacity per socket.
    #[arg(long, default_value_t = 16_000)]
    buffer: usize,
    /// One-way latency in milliseconds.
    #[arg(long, default_value_t = 10)]
    latency_ms: u64,
    /// Packet loss probability.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Packet duplication probability.
    #[arg(long, default_value_t = 0.0)]
    duplicate: f64,
    /// Packet reordering probability.
    #[arg(long, default_value_t = 0.0)]
    reorder: f64,
    /// Bit-flip probability.
    #[arg(long, default_value_t = 0.0)]
    corrupt: f64,
    /// RNG seed.
    #[arg(short, long, default_value_t = 1)]
    seed: u64,
    /// Give up after this many simulated seconds.
    #[arg(long, default_value_t = 600)]
    time_limit: u64,
}

fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = Config {
        mss: cli.mss,
        buffer_size: cli.buffer,
        ..Config::default()
    };
    let mut sim = Simulator::new(SimulatorConfig {
        latency: Duration::from_millis(cli.latency_ms),
        loss_rate: cli.loss,
        duplicate_rate: cli.duplicate,
        reorder_rate: cli.reorder,
        corruption_rate: cli.corrupt,
        seed: cli.seed,
        ..SimulatorConfig::default()
    })?;
    sim.add_node(CLIENT, config.clone())?;
    sim.add_node(SERVER, config)?;

    let listener = sim
        .with_node(SERVER, |m, _| -> Result<SocketId> {
            let s = m.socket();
            m.bind(s, SERVER_PORT)?;
            m.listen(s, 1)?;
            Ok(s)
        })
        .context("server node missing")??;
    let client = sim
        .with_node(CLIENT, |m, host| -> Result<SocketId> {
            let s = m.socket();
            m.bind(s, CLIENT_PORT)?;
            m.connect(s, SERVER, SERVER_PORT, host)?;
            Ok(s)
        })
        .context("client node missing")??;
    log::info!("client {client} connecting to {SERVER}:{SERVER_PORT}");

    let limit = Duration::from_secs(cli.time_limit);
    let mut server = None;
    let connected = sim.run_until(limit, |sim| {
        if server.is_none() {
            server = sim.with_node(SERVER, |m, _| m.accept(listener)).flatten();
        }
        server.is_some() && sim.node(CLIENT).is_some_and(|m| m.is_connected(client))
    });
    let Some(server) = server.filter(|_| connected) else {
        bail!("handshake did not complete within {}s", cli.time_limit);
    };
    log::info!("server accepted connection {server}");

    let payload: Vec<u8> = (0..cli.bytes).map(|i| (i % 251) as u8).collect();
    let mut written = 0;
    let mut received = Vec::with_capacity(cli.bytes);
    let mut chunk = vec![0u8; cli.buffer];
    let tick = Duration::from_millis(cli.latency_ms.max(1));

    while received.len() < payload.len() {
        if sim.now() > limit {
            bail!(
                "transfer stalled: {} of {} bytes after {:?}",
                received.len(),
                payload.len(),
                sim.now()
            );
        }
        if written < payload.len() {
            let n = sim
                .with_node(CLIENT, |m, host| m.write(client, &payload[written..], host))
                .context("client node missing")??;
            written += n;
        }
        sim.run_for(tick);
        let n = sim
            .with_node(SERVER, |m, _| m.read(server, &mut chunk))
            .context("server node missing")??;
        received.extend_from_slice(&chunk[..n]);
    }

    sim.with_node(CLIENT, |m, host| m.close(client, host))
        .context("client node missing")??;
    sim.run_until(limit, |sim| sim.node(CLIENT).is_some_and(|m| m.is_closed(client)));

    let elapsed = sim.now();
    let intact = received == payload;
    println!(
        "transferred {} bytes in {:.3}s simulated: {}",
        received.len(),
        elapsed.as_secs_f64(),
        if intact { "intact" } else { "CORRUPTED" }
    );
    if let Some(socket) = sim.node(CLIENT).and_then(|m| m.get(client)) {
        let stats = socket.stats();
        println!(
            "sender: segments={} windows_retransmitted={} timeouts={} dup_acks={} acked={}",
            stats.segments_sent,
            stats.windows_retransmitted,
            stats.timeouts,
            stats.duplicate_acks,
            stats.bytes_acked
        );
        if let Some(sender) = socket.sender() {
            println!(
                "sender: cwnd={} ssthresh={} state={} rto={:?}",
                sender.cwnd(),
                sender.ssthresh(),
                sender.congestion_state(),
                sender.rto()
            );
        }
    }
    let net = sim.stats();
    println!(
        "network: sent={} lost={} duplicated={} reordered={} corrupted={}",
        net.sent, net.lost, net.duplicated, net.reordered, net.corrupted
    );

    if !intact {
        bail!("received stream differs from what was sent");
    }
    Ok(())
}
