//! command_monitor - print the command records a follower publishes.
//!
//! Connects to the command port, logs one line per record and reconnects
//! when the follower restarts.

use anyhow::Result;
use clap::Parser;
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use teleop_follower::transport::{unix_seconds, CommandRecord};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Log command records from a follower")]
struct Args {
    /// Follower command address.
    #[arg(long, env = "FOLLOWER_CMD_ADDR", default_value = "127.0.0.1:5556")]
    addr: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || stop_handler.store(true, Ordering::SeqCst))?;

    while !stop.load(Ordering::SeqCst) {
        let stream = match TcpStream::connect(&args.addr) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("connect {} failed: {}; retrying", args.addr, e);
                std::thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        stream.set_read_timeout(Some(RECONNECT_DELAY))?;
        log::info!("connected to {}", args.addr);
        if let Err(e) = follow(stream, &stop) {
            log::warn!("connection lost: {}", e);
        }
    }
    Ok(())
}

fn follow(stream: TcpStream, stop: &AtomicBool) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while !stop.load(Ordering::SeqCst) {
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                match serde_json::from_str::<CommandRecord>(line.trim_end()) {
                    Ok(record) => {
                        let lag = unix_seconds(std::time::SystemTime::now()) - record.ts;
                        log::info!(
                            "linear={:+.3} angular={:+.3} status={} lag={:.0}ms",
                            record.linear,
                            record.angular,
                            record.status,
                            lag * 1000.0
                        );
                    }
                    Err(e) => log::warn!("unparseable record {:?}: {}", line.trim_end(), e),
                }
                line.clear();
            }
            // keep any partial line and poll the stop flag
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
