use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Test client for the ioarena echo server")]
struct Args {
    /// Server port
    #[arg(short, long, default_value_t = 9900)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Echo messages of several sizes and verify them (default)
    Smoke {
        /// Server chunk size; messages up to 4x this are sent
        #[arg(short, long, default_value_t = 1024)]
        chunk_size: usize,
    },
    /// Round-trip throughput over concurrent connections
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Round trips per connection
        #[arg(short, long, default_value_t = 100_000)]
        requests: usize,
        /// Message size in bytes
        #[arg(short, long, default_value_t = 64)]
        size: usize,
    },
    /// Open connections and hold them, to watch admission back-pressure
    Hold {
        /// Connections to open
        #[arg(short, long, default_value_t = 16)]
        connections: usize,
        /// Seconds to hold them
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn round_trip(stream: &mut TcpStream, msg: &[u8], buf: &mut Vec<u8>) {
    stream.write_all(msg).expect("failed to write");
    buf.resize(msg.len(), 0);
    stream.read_exact(buf).expect("failed to read echo");
}

fn main() {
    let args = Args::parse();
    let addr = format!("127.0.0.1:{}", args.port);

    match args
        .command
        .unwrap_or(Command::Smoke { chunk_size: 1024 })
    {
        Command::Smoke { chunk_size } => smoke_test(&addr, chunk_size),
        Command::Bench {
            connections,
            requests,
            size,
        } => bench_test(&addr, connections, requests, size),
        Command::Hold {
            connections,
            seconds,
        } => hold_test(&addr, connections, seconds),
    }
}

fn smoke_test(addr: &str, chunk_size: usize) {
    eprintln!("smoke test: connecting to {}", addr);
    let mut stream = TcpStream::connect(addr).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set_read_timeout failed");

    let mut buf = Vec::new();
    let sizes = [1, 7, chunk_size - 1, chunk_size, chunk_size + 1, chunk_size * 4];
    for (i, &len) in sizes.iter().enumerate() {
        let msg = pattern(len, i as u8);
        round_trip(&mut stream, &msg, &mut buf);
        assert_eq!(buf, msg, "echo mismatch for {len}-byte message");
        eprintln!("  {len} bytes: OK");
    }

    // A second connection gets its own chunks.
    let mut other = TcpStream::connect(addr).expect("failed to connect");
    let msg = pattern(chunk_size * 2, 0xA5);
    round_trip(&mut other, &msg, &mut buf);
    assert_eq!(buf, msg, "echo mismatch on second connection");
    eprintln!("  second connection: OK");

    eprintln!("smoke test: PASSED");
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let i = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[i.min(sorted.len() - 1)] as f64 / 1_000.0
}

fn bench_test(addr: &str, num_connections: usize, requests_per_conn: usize, size: usize) {
    eprintln!(
        "bench: {} connections x {} round trips of {} bytes to {}",
        num_connections, requests_per_conn, size, addr
    );

    let start = Instant::now();

    let handles: Vec<_> = (0..num_connections)
        .map(|c| {
            let addr = addr.to_string();
            std::thread::spawn(move || {
                let mut stream = TcpStream::connect(&addr).expect("failed to connect");
                stream.set_nodelay(true).expect("set_nodelay failed");
                let msg = pattern(size, c as u8);
                let mut buf = Vec::with_capacity(size);
                let mut latencies = Vec::with_capacity(requests_per_conn);
                for _ in 0..requests_per_conn {
                    let sent_at = Instant::now();
                    round_trip(&mut stream, &msg, &mut buf);
                    latencies.push(sent_at.elapsed().as_nanos() as u64);
                }
                assert_eq!(buf, msg, "echo mismatch");
                latencies
            })
        })
        .collect();

    let mut all_samples = Vec::with_capacity(num_connections * requests_per_conn);
    for h in handles {
        all_samples.extend(h.join().expect("thread panicked"));
    }

    let elapsed = start.elapsed();
    if all_samples.is_empty() {
        eprintln!("no samples collected");
        return;
    }
    all_samples.sort_unstable();
    let total = all_samples.len();
    let rps = total as f64 / elapsed.as_secs_f64();
    let mbps = (total * size * 2) as f64 / elapsed.as_secs_f64() / 1_000_000.0;
    eprintln!(
        "bench: {} round trips in {:.2}s = {:.0} RPS, {:.1} MB/s",
        total,
        elapsed.as_secs_f64(),
        rps,
        mbps
    );
    eprintln!("  p50     {:.1}µs", percentile(&all_samples, 50.0));
    eprintln!("  p99     {:.1}µs", percentile(&all_samples, 99.0));
    eprintln!("  p99.9   {:.1}µs", percentile(&all_samples, 99.9));
    eprintln!(
        "  max     {:.1}µs",
        all_samples[total - 1] as f64 / 1_000.0
    );
}

fn hold_test(addr: &str, num_connections: usize, seconds: u64) {
    eprintln!("hold: opening {} connections to {}", num_connections, addr);
    let mut streams = Vec::with_capacity(num_connections);
    let mut buf = Vec::new();
    for i in 0..num_connections {
        let mut stream = TcpStream::connect(addr).expect("failed to connect");
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("set_read_timeout failed");
        let msg = [i as u8];
        stream.write_all(&msg).expect("failed to write");
        buf.resize(1, 0);
        match stream.read_exact(&mut buf) {
            Ok(()) => eprintln!("  connection {i}: admitted"),
            Err(_) => eprintln!("  connection {i}: waiting for admission"),
        }
        streams.push(stream);
    }
    std::thread::sleep(Duration::from_secs(seconds));
    eprintln!("hold: releasing {} connections", streams.len());
}
