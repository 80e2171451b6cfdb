//! Outbound velocity commands.
//!
//! One `CommandRecord` is published per control iteration. Delivery is best
//! effort: no acknowledgement, no retry. A lost record is superseded by the
//! next one a control period later.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::control::{SmoothedCommand, Status};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Wire record: `{"linear", "angular", "status", "ts"}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub linear: f64,
    pub angular: f64,
    pub status: String,
    /// Unix time in seconds.
    pub ts: f64,
}

impl CommandRecord {
    pub fn new(command: SmoothedCommand, status: &Status, at: SystemTime) -> Self {
        Self {
            linear: command.linear,
            angular: command.angular,
            status: status.to_string(),
            ts: unix_seconds(at),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| anyhow!("failed to encode command: {}", e))
    }
}

pub fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Best-effort command sink. `publish` must never block the control loop.
pub trait CommandPublisher: Send {
    fn name(&self) -> &'static str;

    fn publish(&mut self, record: &CommandRecord) -> Result<()>;
}

/// In-memory publisher for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    records: Arc<Mutex<Vec<CommandRecord>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CommandRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CommandPublisher for MemoryPublisher {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn publish(&mut self, record: &CommandRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Publishes newline-delimited JSON records to every connected TCP subscriber.
///
/// Subscriber sockets are non-blocking. A subscriber that cannot take a whole
/// record immediately is disconnected; it may reconnect and will receive the
/// next record.
pub struct TcpCommandPublisher {
    addr: SocketAddr,
    subscribers: Arc<Mutex<Vec<TcpStream>>>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TcpCommandPublisher {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| anyhow!("failed to bind command port {}: {}", addr, e))?;
        let local = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let subscribers_thread = Arc::clone(&subscribers);
        let shutdown_thread = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("cmd-accept".into())
            .spawn(move || accept_subscribers(listener, subscribers_thread, shutdown_thread))?;

        Ok(Self {
            addr: local,
            subscribers,
            shutdown,
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn accept_subscribers(
    listener: TcpListener,
    subscribers: Arc<Mutex<Vec<TcpStream>>>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream
                    .set_nonblocking(true)
                    .and_then(|_| stream.set_nodelay(true))
                {
                    log::warn!("command subscriber {} setup failed: {}", peer, e);
                    continue;
                }
                log::info!("command subscriber connected: {}", peer);
                subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("command accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

impl CommandPublisher for TcpCommandPublisher {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn publish(&mut self, record: &CommandRecord) -> Result<()> {
        let mut line = record.to_json()?;
        line.push('\n');
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain_mut(|stream| match stream.write_all(line.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                let peer = stream
                    .peer_addr()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|_| "?".into());
                log::debug!("dropping command subscriber {}: {}", peer, e);
                false
            }
        });
        Ok(())
    }
}

impl Drop for TcpCommandPublisher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_with_wire_field_names() {
        let record = CommandRecord {
            linear: 0.1,
            angular: -0.05,
            status: "SEARCH".into(),
            ts: 1700000000.5,
        };
        let value: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(value["linear"], 0.1);
        assert_eq!(value["angular"], -0.05);
        assert_eq!(value["status"], "SEARCH");
        assert_eq!(value["ts"], 1700000000.5);
    }

    #[test]
    fn record_formats_status() {
        let at = UNIX_EPOCH + Duration::from_secs(10);
        let record = CommandRecord::new(SmoothedCommand::default(), &Status::Emergency, at);
        assert_eq!(record.status, "EMERGENCY: HAND RAISE");
        assert_eq!(record.ts, 10.0);
    }

    #[test]
    fn memory_publisher_keeps_records_in_order() {
        let publisher = MemoryPublisher::new();
        let mut sink: Box<dyn CommandPublisher> = Box::new(publisher.clone());
        for i in 0..3 {
            let record = CommandRecord {
                linear: i as f64,
                angular: 0.0,
                status: "SEARCH".into(),
                ts: 0.0,
            };
            sink.publish(&record).unwrap();
        }
        let linears: Vec<f64> = publisher.records().iter().map(|r| r.linear).collect();
        assert_eq!(linears, vec![0.0, 1.0, 2.0]);
    }
}
