use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::frame::Frame;

const RECV_BUFFER_SIZE: usize = 4096;
/// Inbound bytes kept per client while waiting for a delimiter
const MAX_PENDING_TELEMETRY: usize = 4096;
pub const TELEMETRY_DELIMITER: u8 = b'|';

/// One connected viewer or sensor client
struct ClientConnection {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: Vec<u8>,
}

impl ClientConnection {
    /// Drain everything readable. Returns false when the client is gone.
    fn read_available(&mut self, scratch: &mut [u8], keep: bool) -> bool {
        if !keep {
            // A partial token from before telemetry was wanted must not
            // prefix the first token after
            self.inbound.clear();
        }

        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    debug!("{} closed the connection", self.peer);
                    return false;
                }
                Ok(n) => {
                    if keep {
                        self.inbound.extend_from_slice(&scratch[..n]);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Read from {} failed: {}", self.peer, e);
                    return false;
                }
            }
        }
    }

    fn take_latest_token(&mut self) -> Option<String> {
        let token = latest_token(&mut self.inbound);
        if self.inbound.len() > MAX_PENDING_TELEMETRY {
            warn!("Discarding undelimited telemetry from {}", self.peer);
            self.inbound.clear();
        }
        token
    }
}

/// Multiplexes TCP clients from the render loop without ever blocking it.
///
/// Every tick each client is sent the frame as three raw planes. Clients that
/// close, error, or cannot take a whole frame right now are dropped.
pub struct Broadcaster {
    listener: TcpListener,
    clients: Vec<ClientConnection>,
    scratch: Vec<u8>,
    frames_written: Arc<AtomicU64>,
    connected: Arc<AtomicUsize>,
}

impl Broadcaster {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).context(format!("Failed to bind to {}", addr))?;
        listener.set_nonblocking(true)?;
        info!("Frame broadcaster listening on {}", listener.local_addr()?);

        Ok(Broadcaster {
            listener,
            clients: Vec::new(),
            scratch: vec![0u8; RECV_BUFFER_SIZE],
            frames_written: Arc::new(AtomicU64::new(0)),
            connected: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[allow(dead_code)]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Counter of frames written to clients (for statistics)
    pub fn frames_written_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames_written)
    }

    /// Number of connected clients as of the last tick (for statistics)
    pub fn client_count_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connected)
    }

    /// Service all client I/O for one tick and send `frame` to every client.
    ///
    /// With `collect_telemetry`, inbound bytes are kept and the most recent
    /// complete token across all clients is returned; otherwise they are
    /// discarded.
    pub fn service(&mut self, frame: &Frame, collect_telemetry: bool) -> Option<String> {
        self.accept_pending();

        let scratch = &mut self.scratch;
        self.clients.retain_mut(|client| {
            if let Ok(Some(e)) = client.stream.take_error() {
                info!("Dropping {} after socket error: {}", client.peer, e);
                return false;
            }

            let alive = client.read_available(scratch, collect_telemetry);
            if !alive {
                info!("Client {} disconnected", client.peer);
            }
            alive
        });

        let telemetry = if collect_telemetry {
            self.clients
                .iter_mut()
                .filter_map(ClientConnection::take_latest_token)
                .last()
        } else {
            None
        };

        self.write_frame(frame);
        self.connected.store(self.clients.len(), Ordering::Relaxed);
        telemetry
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Rejecting {}: cannot make socket non-blocking: {}", peer, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    info!("Client connected from {}", peer);
                    self.clients.push(ClientConnection {
                        stream,
                        peer,
                        inbound: Vec::new(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    break;
                }
            }
        }
    }

    fn write_frame(&mut self, frame: &Frame) {
        if self.clients.is_empty() {
            return;
        }

        let data = frame.to_planes();
        let frames_written = &self.frames_written;
        self.clients.retain_mut(|client| match client.stream.write_all(&data) {
            Ok(()) => {
                frames_written.fetch_add(1, Ordering::Relaxed);
                trace!("Wrote {} bytes to {}", data.len(), client.peer);
                true
            }
            Err(e) => {
                info!("Dropping {} after write failure: {}", client.peer, e);
                false
            }
        });
    }
}

/// Pull the newest complete `|`-delimited token out of `buffer`.
///
/// Older complete tokens are dropped; bytes after the last delimiter stay
/// buffered for the next read.
pub fn latest_token(buffer: &mut Vec<u8>) -> Option<String> {
    let last = buffer.iter().rposition(|&b| b == TELEMETRY_DELIMITER)?;
    let complete: Vec<u8> = buffer.drain(..=last).collect();

    complete
        .split(|&b| b == TELEMETRY_DELIMITER)
        .map(|token| String::from_utf8_lossy(token).trim().to_string())
        .filter(|token| !token.is_empty())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Color;
    use std::net::Shutdown;
    use std::thread;
    use std::time::{Duration, Instant};

    const NUM_PIXELS: usize = 4;

    fn broadcaster() -> (Broadcaster, SocketAddr) {
        let broadcaster = Broadcaster::bind("127.0.0.1:0").unwrap();
        let addr = broadcaster.local_addr().unwrap();
        (broadcaster, addr)
    }

    /// Tick until `done` holds or a second passes
    fn tick_until(
        broadcaster: &mut Broadcaster,
        frame: &Frame,
        collect: bool,
        mut done: impl FnMut(&Broadcaster, &Option<String>) -> bool,
    ) -> Option<String> {
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let telemetry = broadcaster.service(frame, collect);
            if done(broadcaster, &telemetry) || Instant::now() > deadline {
                return telemetry;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_latest_token() {
        let mut buffer = b"12|34|5".to_vec();
        assert_eq!(latest_token(&mut buffer), Some("34".to_string()));
        assert_eq!(buffer, b"5".to_vec());

        assert_eq!(latest_token(&mut buffer), None);
        buffer.extend_from_slice(b"6|");
        assert_eq!(latest_token(&mut buffer), Some("56".to_string()));
        assert!(buffer.is_empty());

        let mut empty_tokens = b"||".to_vec();
        assert_eq!(latest_token(&mut empty_tokens), None);
    }

    #[test]
    fn test_client_receives_planes() {
        let (mut broadcaster, addr) = broadcaster();
        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let mut frame = Frame::blank(NUM_PIXELS);
        frame.set(0, Color::new(1, 2, 3));
        tick_until(&mut broadcaster, &frame, false, |b, _| b.client_count() == 1);

        let mut received = vec![0u8; NUM_PIXELS * 3];
        client.read_exact(&mut received).unwrap();
        assert_eq!(received, vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_closed_client_removed_before_write() {
        let (mut broadcaster, addr) = broadcaster();
        let client = TcpStream::connect(addr).unwrap();
        let frame = Frame::blank(NUM_PIXELS);
        tick_until(&mut broadcaster, &frame, false, |b, _| b.client_count() == 1);
        assert_eq!(broadcaster.client_count(), 1);

        drop(client);
        tick_until(&mut broadcaster, &frame, false, |b, _| b.client_count() == 0);
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[test]
    fn test_eof_client_removed_in_same_tick_without_write() {
        let (mut broadcaster, addr) = broadcaster();
        let client = TcpStream::connect(addr).unwrap();
        let frame = Frame::blank(NUM_PIXELS);
        tick_until(&mut broadcaster, &frame, false, |b, _| b.client_count() == 1);
        assert_eq!(broadcaster.client_count(), 1);

        // Half-close: the server sees EOF while the client can still receive,
        // so a write would succeed if the client were kept
        client.shutdown(Shutdown::Write).unwrap();
        thread::sleep(Duration::from_millis(50));

        let written = broadcaster.frames_written_counter();
        let before = written.load(Ordering::Relaxed);
        broadcaster.service(&frame, false);

        assert_eq!(broadcaster.client_count(), 0);
        assert_eq!(written.load(Ordering::Relaxed), before);
        assert_eq!(broadcaster.client_count_gauge().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_partial_token_dropped_while_not_collecting() {
        let (mut broadcaster, addr) = broadcaster();
        let mut client = TcpStream::connect(addr).unwrap();
        let frame = Frame::blank(NUM_PIXELS);
        tick_until(&mut broadcaster, &frame, false, |b, _| b.client_count() == 1);

        // Collect for one tick so the undelimited "12" is buffered
        client.write_all(b"12").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(broadcaster.service(&frame, true), None);

        // Telemetry no longer wanted, then wanted again
        broadcaster.service(&frame, false);
        client.write_all(b"34|").unwrap();
        let telemetry = tick_until(&mut broadcaster, &frame, true, |_, t| t.is_some());
        assert_eq!(telemetry, Some("34".to_string()));
    }

    #[test]
    fn test_client_count_gauge() {
        let (mut broadcaster, addr) = broadcaster();
        let gauge = broadcaster.client_count_gauge();
        let _client = TcpStream::connect(addr).unwrap();
        let frame = Frame::blank(NUM_PIXELS);
        tick_until(&mut broadcaster, &frame, false, |b, _| b.client_count() == 1);
        assert_eq!(gauge.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_telemetry_keeps_most_recent() {
        let (mut broadcaster, addr) = broadcaster();
        let mut client = TcpStream::connect(addr).unwrap();
        let frame = Frame::blank(NUM_PIXELS);
        tick_until(&mut broadcaster, &frame, true, |b, _| b.client_count() == 1);

        client.write_all(b"100|200|30").unwrap();
        let telemetry = tick_until(&mut broadcaster, &frame, true, |_, t| t.is_some());
        assert_eq!(telemetry, Some("200".to_string()));

        client.write_all(b"0|").unwrap();
        let telemetry = tick_until(&mut broadcaster, &frame, true, |_, t| t.is_some());
        assert_eq!(telemetry, Some("300".to_string()));
    }

    #[test]
    fn test_telemetry_ignored_when_not_collecting() {
        let (mut broadcaster, addr) = broadcaster();
        let mut client = TcpStream::connect(addr).unwrap();
        let frame = Frame::blank(NUM_PIXELS);
        tick_until(&mut broadcaster, &frame, false, |b, _| b.client_count() == 1);

        client.write_all(b"1|2|").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(broadcaster.service(&frame, false), None);
        assert_eq!(broadcaster.client_count(), 1);
    }
}
