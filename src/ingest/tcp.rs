//! Length-prefixed image frames over TCP.
//!
//! Each message is a 4-byte big-endian payload length followed by one encoded
//! image. The subscriber binds the video port, accepts any number of
//! publishers and posts every decoded frame into the shared `FrameChannel`.

use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::Frame;
use crate::transport::FrameChannel;

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(200);
const DISCARD_CHUNK: usize = 64 * 1024;

/// Reception counters for health logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub connections: u64,
    pub received: u64,
    pub decode_errors: u64,
    pub oversize: u64,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    received: AtomicU64,
    decode_errors: AtomicU64,
    oversize: AtomicU64,
    seq: AtomicU64,
}

pub struct TcpFrameSubscriber {
    addr: SocketAddr,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TcpFrameSubscriber {
    pub fn bind(addr: &str, channel: FrameChannel) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| anyhow!("failed to bind video port {}: {}", addr, e))?;
        let local = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters_thread = Arc::clone(&counters);
        let shutdown_thread = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("video-accept".into())
            .spawn(move || accept_publishers(listener, channel, counters_thread, shutdown_thread))
            .context("spawn video accept thread")?;

        log::info!("waiting for video frames on {}", local);
        Ok(Self {
            addr: local,
            counters,
            shutdown,
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            connections: self.counters.connections.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            oversize: self.counters.oversize.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting and wait for every reader thread to exit.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for TcpFrameSubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_publishers(
    listener: TcpListener,
    channel: FrameChannel,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
) {
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                counters.connections.fetch_add(1, Ordering::Relaxed);
                log::info!("video publisher connected: {}", peer);
                let channel = channel.clone();
                let counters = Arc::clone(&counters);
                let shutdown = Arc::clone(&shutdown);
                let spawned = std::thread::Builder::new()
                    .name("video-reader".into())
                    .spawn(move || {
                        if let Err(e) = read_frames(stream, &channel, &counters, &shutdown) {
                            log::warn!("video publisher {} dropped: {}", peer, e);
                        } else {
                            log::info!("video publisher {} disconnected", peer);
                        }
                    });
                match spawned {
                    Ok(handle) => readers.push(handle),
                    Err(e) => log::error!("failed to spawn video reader for {}: {}", peer, e),
                }
                readers.retain(|handle| !handle.is_finished());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("video accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    for handle in readers {
        let _ = handle.join();
    }
}

enum ReadOutcome {
    Complete,
    Closed,
}

fn read_frames(
    mut stream: TcpStream,
    channel: &FrameChannel,
    counters: &Counters,
    shutdown: &AtomicBool,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    let mut header = [0u8; 4];
    let mut payload = Vec::new();
    loop {
        if let ReadOutcome::Closed = read_full(&mut stream, &mut header, shutdown)? {
            return Ok(());
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_BYTES {
            counters.oversize.fetch_add(1, Ordering::Relaxed);
            log::warn!("skipping {} byte frame (limit {})", len, MAX_FRAME_BYTES);
            if let ReadOutcome::Closed = discard(&mut stream, len, shutdown)? {
                return Ok(());
            }
            continue;
        }
        payload.resize(len, 0);
        if let ReadOutcome::Closed = read_full(&mut stream, &mut payload, shutdown)? {
            return Ok(());
        }
        counters.received.fetch_add(1, Ordering::Relaxed);
        let seq = counters.seq.fetch_add(1, Ordering::Relaxed);
        match Frame::decode(&payload, seq) {
            Ok(frame) => {
                channel.post(frame);
            }
            Err(e) => {
                counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("frame {} decode failed: {:#}", seq, e);
            }
        }
    }
}

/// Fill `buf` completely, tolerating read timeouts so shutdown stays
/// responsive. EOF before the first byte is a clean close.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], shutdown: &AtomicBool) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(ReadOutcome::Closed);
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::Closed),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed mid-message",
                ))
            }
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Complete)
}

fn discard(stream: &mut TcpStream, mut remaining: usize, shutdown: &AtomicBool) -> io::Result<ReadOutcome> {
    let mut chunk = vec![0u8; DISCARD_CHUNK];
    while remaining > 0 {
        let take = remaining.min(DISCARD_CHUNK);
        match read_full(stream, &mut chunk[..take], shutdown)? {
            ReadOutcome::Complete => remaining -= take,
            ReadOutcome::Closed => return Ok(ReadOutcome::Closed),
        }
    }
    Ok(ReadOutcome::Complete)
}

/// Write one length-prefixed message.
pub fn write_frame_message(writer: &mut impl Write, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(anyhow!(
            "frame payload {} bytes exceeds limit {}",
            payload.len(),
            MAX_FRAME_BYTES
        ));
    }
    let len = u32::try_from(payload.len()).context("frame length")?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Encode a frame as JPEG for publishing.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    frame
        .image()
        .write_to(&mut out, ImageFormat::Jpeg)
        .context("encode jpeg")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_has_big_endian_length_prefix() {
        let mut buf = Vec::new();
        write_frame_message(&mut buf, b"abc").unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn oversize_payload_is_rejected_by_writer() {
        let payload = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(write_frame_message(&mut Vec::new(), &payload).is_err());
    }

    #[test]
    fn jpeg_encoding_decodes_back_to_same_size() {
        let frame = Frame::solid(32, 24, [200, 10, 10]);
        let bytes = encode_jpeg(&frame).unwrap();
        let decoded = Frame::decode(&bytes, 3).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        assert_eq!(decoded.seq(), 3);
    }
}
