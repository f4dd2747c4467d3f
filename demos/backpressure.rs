//! Backpressure Example - pausing a producer at the high-water mark
//!
//! A producer thread pushes chunks into a connection whose peer reads
//! slowly. When the output buffer crosses the high-water mark the producer
//! pauses, and it resumes once the write-complete callback reports the
//! buffer drained. After the last chunk the connection is shut down and the
//! reader sees end-of-stream.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example backpressure -- --total-kib 8192 -v
//! ```

use clap::Parser;
use rustconn::prelude::*;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CHUNK_SIZE: usize = 16 * 1024;

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

#[derive(Parser)]
#[command(author, version, about = "High-water-mark backpressure demo", long_about = None)]
struct Args {
    /// Total amount to transfer, in KiB
    #[arg(long, default_value_t = 4096)]
    total_kib: usize,

    /// High-water mark, in KiB
    #[arg(long, default_value_t = 256)]
    high_water_kib: usize,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Reads everything in small, slow steps and returns the byte count.
fn slow_reader(mut stream: TcpStream) -> std::io::Result<usize> {
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
        thread::sleep(Duration::from_micros(200));
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let mut event_loop = EventLoop::new()?;
    let table = ConnectionTable::new(event_loop.reactor());

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;
    let reader = thread::spawn(move || slow_reader(client));

    let conn = Connection::from_stream(event_loop.reactor(), "producer", StreamSocket::from_std(server)?)?;

    let paused = Arc::new(AtomicBool::new(false));
    let pauses = Arc::new(AtomicUsize::new(0));

    let (p, count) = (paused.clone(), pauses.clone());
    conn.set_high_water_mark_callback(
        move |conn, size| {
            println!("{}: {size} bytes buffered, pausing producer", conn.name());
            count.fetch_add(1, Ordering::Relaxed);
            p.store(true, Ordering::Release);
        },
        args.high_water_kib * 1024,
    );
    let p = paused.clone();
    conn.set_write_complete_callback(move |_conn| p.store(false, Ordering::Release));
    let quit = event_loop.handle();
    conn.set_connection_callback(move |conn| {
        if conn.disconnected() {
            quit.quit();
        }
    });
    table.adopt(conn.clone());

    let producer = {
        let conn = conn.clone();
        let total = args.total_kib * 1024;
        thread::spawn(move || {
            let chunk = vec![b'x'; CHUNK_SIZE];
            let mut sent = 0;
            while sent < total {
                if paused.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                let len = CHUNK_SIZE.min(total - sent);
                conn.send(&chunk[..len]);
                sent += len;
            }
            conn.shutdown();
        })
    };

    event_loop.run()?;

    let _ = producer.join();
    let received = match reader.join() {
        Ok(result) => result?,
        Err(_) => 0,
    };
    let stats = conn.stats();
    println!(
        "Transferred {received} bytes ({} sent), producer paused {} times",
        stats.bytes_sent,
        pauses.load(Ordering::Relaxed)
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Backpressure demo failed: {err}");
            ExitCode::FAILURE
        }
    }
}
