//! Echo Example - TCP and connected UDP on one event loop
//!
//! Accepts TCP connections on a blocking listener thread and hands each one
//! to the event loop, where it echoes everything back until the peer closes.
//! With `--udp-peer`, a connected datagram socket echoes datagrams from that
//! peer as well.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example echo -- -v
//! cargo run --example echo -- --udp-peer 127.0.0.1:9001 --config echo.toml
//! ```

use clap::Parser;
use config::Config;
use rustconn::prelude::*;
use rustconn::{ConnectionConfig, LoopConfig};
use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = format!("rustconn={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Echo server", long_about = None)]
struct Args {
    /// TCP address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    bind: String,

    /// Peer to echo datagrams for
    #[arg(long)]
    udp_peer: Option<String>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

fn load_config(path: Option<&str>) -> Result<Config, Error> {
    match path {
        Some(path) => Ok(Config::builder()
            .add_source(config::File::with_name(path))
            .build()?),
        None => Ok(Config::default()),
    }
}

fn echo(conn: &ConnectionRef) {
    conn.set_message_callback(|conn, buffer, _at| {
        let data = buffer.retrieve_all_as_vec();
        conn.send(&data);
    });
    conn.set_connection_callback(|conn| {
        println!(
            "{} {} -> {} is {}",
            conn.name(),
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    });
}

fn run(args: &Args) -> Result<(), Error> {
    let config = load_config(args.config.as_deref())?;
    let mut event_loop = EventLoop::with_config(&LoopConfig::from_config(&config, "echo"))?;
    let table = Arc::new(ConnectionTable::new(event_loop.reactor()));

    if let Some(peer) = &args.udp_peer {
        let conn_config = ConnectionConfig::from_config(&config, "udp");
        let socket = DatagramSocket::connect_with_config("0.0.0.0:0", peer.as_str(), &conn_config)?;
        let conn = Connection::from_datagram(event_loop.reactor(), "udp", socket)?;
        echo(&conn);
        table.adopt(conn);
    }

    let listener = TcpListener::bind(&args.bind)?;
    println!("Echo server listening on {}", listener.local_addr()?);

    let reactor = event_loop.reactor();
    let acceptor_table = table.clone();
    thread::spawn(move || {
        let conn_config = ConnectionConfig::from_config(&config, "tcp");
        for (id, stream) in listener.incoming().enumerate() {
            let accepted = stream.map_err(Error::from).and_then(|stream| {
                let socket = StreamSocket::from_std_with_config(stream, &conn_config)?;
                let local_addr = socket.local_addr()?;
                let peer_addr = socket.peer_addr()?;
                Ok(Connection::with_config(
                    reactor.clone(),
                    format!("tcp-{id}"),
                    Box::new(socket),
                    local_addr,
                    peer_addr,
                    &conn_config,
                ))
            });
            match accepted {
                Ok(conn) => {
                    echo(&conn);
                    acceptor_table.adopt(conn);
                }
                Err(err) => eprintln!("Failed to accept connection: {err}"),
            }
        }
    });

    event_loop.run()
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Echo server failed: {err}");
            ExitCode::FAILURE
        }
    }
}
