//! Broadcast transport: bind/connect sockets, multipart frames, bounded poll.
//!
//! Wire format, per frame: `[4-byte LE length][1-byte flags][bytes]`; flags
//! bit 0 is the more-to-follow marker, so a multipart message is a frame
//! sequence ending at the first frame with the bit clear.
//!
//! A [`PubSocket`] owns a listener plus an accept thread and fans every
//! message out to all connected subscribers; a [`SubSocket`] owns a dial
//! thread that keeps (re)connecting to its peer and queues complete,
//! filter-matched messages for the poll loop. Readiness is edge-triggered
//! from the consumer's point of view: a wakeup is only guaranteed for the
//! transition to non-empty, so callers must drain queues until a poll pass
//! finds nothing ready.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use thiserror::Error;
use tracing::{debug, trace, warn};

const FRAME_HEADER_LEN: usize = 5;
const FLAG_MORE: u8 = 0x01;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("socket queue closed underneath the poll set")]
    SocketClosed,
}

/// One complete multipart message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub frames: Vec<Vec<u8>>,
}

/// Shared transport tunables. One context per receiver group; publishers
/// carry a private one.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<Config>,
}

#[derive(Debug)]
struct Config {
    connect_timeout: Duration,
    connect_retry: Duration,
    accept_tick: Duration,
    write_timeout: Duration,
    max_frame_bytes: usize,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Config {
                connect_timeout: Duration::from_millis(250),
                connect_retry: Duration::from_millis(50),
                accept_tick: Duration::from_millis(25),
                write_timeout: Duration::from_secs(1),
                max_frame_bytes: 16 * 1024 * 1024,
            }),
        }
    }

    fn cfg(&self) -> &Config {
        &self.inner
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn write_message(writer: &mut impl Write, frames: &[Vec<u8>]) -> io::Result<()> {
    for (i, frame) in frames.iter().enumerate() {
        let flags = if i + 1 < frames.len() { FLAG_MORE } else { 0 };
        writer.write_all(&(frame.len() as u32).to_le_bytes())?;
        writer.write_all(&[flags])?;
        writer.write_all(frame)?;
    }
    writer.flush()
}

/// Read one multipart message. `Ok(None)` means the peer closed the stream
/// cleanly at a message boundary.
fn read_message(reader: &mut impl Read, max_frame_bytes: usize) -> io::Result<Option<Message>> {
    let mut frames = Vec::new();
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if frames.is_empty() {
            if !read_exact_or_eof(reader, &mut header)? {
                return Ok(None);
            }
        } else {
            reader.read_exact(&mut header)?;
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > max_frame_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit {max_frame_bytes}"),
            ));
        }
        let more = header[4] & FLAG_MORE != 0;

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        frames.push(body);

        if !more {
            return Ok(Some(Message { frames }));
        }
    }
}

/// `read_exact` that reports a clean EOF before the first byte as `false`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame header truncated",
            ));
        }
        filled += n;
    }
    Ok(true)
}

/// Broadcast socket: binds, accepts subscribers in the background, and
/// writes every message to all of them. Connections that fall behind or
/// break are dropped; their subscribers reconnect and miss the interim.
pub struct PubSocket {
    local_addr: SocketAddr,
    connections: Arc<Mutex<Vec<TcpStream>>>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    context: Context,
}

impl PubSocket {
    pub fn bind(context: &Context, addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let connections = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let connections = Arc::clone(&connections);
            let stop = Arc::clone(&stop);
            let context = context.clone();
            thread::spawn(move || accept_loop(listener, connections, stop, context))
        };

        debug!(%local_addr, "publisher socket bound");
        Ok(Self {
            local_addr,
            connections,
            stop,
            accept_thread: Some(accept_thread),
            context: context.clone(),
        })
    }

    /// The bound endpoint, with the OS-assigned port filled in.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connection list poisoned").len()
    }

    /// Send one multipart message to every connected subscriber. Broken
    /// connections are dropped silently; sending with no subscribers is a
    /// successful no-op.
    pub fn send(&self, frames: &[Vec<u8>]) -> io::Result<()> {
        let max = self.context.cfg().max_frame_bytes;
        for frame in frames {
            if frame.len() > max {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds limit {max}", frame.len()),
                ));
            }
        }

        let mut connections = self.connections.lock().expect("connection list poisoned");
        connections.retain_mut(|stream| match write_message(stream, frames) {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, "dropping subscriber connection");
                false
            }
        });
        Ok(())
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        self.connections
            .lock()
            .expect("connection list poisoned")
            .clear();
    }
}

fn accept_loop(
    listener: TcpListener,
    connections: Arc<Mutex<Vec<TcpStream>>>,
    stop: Arc<AtomicBool>,
    context: Context,
) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                stream.set_nodelay(true).ok();
                stream
                    .set_write_timeout(Some(context.cfg().write_timeout))
                    .ok();
                trace!(%peer, "subscriber connected");
                connections
                    .lock()
                    .expect("connection list poisoned")
                    .push(stream);
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(context.cfg().accept_tick);
            }
            Err(error) => {
                warn!(%error, "accept failed");
                thread::sleep(context.cfg().accept_tick);
            }
        }
    }
}

/// Connecting socket: dials the peer until it appears, then reads multipart
/// messages, applies the prefix subscription filter, and queues matches.
///
/// Connecting to a not-yet-running publisher is valid; messages start to
/// flow once the peer binds. A dropped stream triggers a reconnect.
pub struct SubSocket {
    peer: SocketAddr,
    rx: Receiver<Message>,
    front: Arc<Mutex<VecDeque<Message>>>,
    filters: Arc<Mutex<Vec<Vec<u8>>>>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    stop: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl SubSocket {
    pub fn connect(context: &Context, addr: &str) -> io::Result<Self> {
        let peer = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {addr}")))?;

        let (tx, rx) = unbounded();
        let filters = Arc::new(Mutex::new(Vec::new()));
        let stream = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let reader_thread = {
            let filters = Arc::clone(&filters);
            let stream = Arc::clone(&stream);
            let stop = Arc::clone(&stop);
            let context = context.clone();
            thread::spawn(move || reader_loop(peer, context, tx, filters, stream, stop))
        };

        Ok(Self {
            peer,
            rx,
            front: Arc::new(Mutex::new(VecDeque::new())),
            filters,
            stream,
            stop,
            reader_thread: Some(reader_thread),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Deliver messages whose first frame starts with `prefix`. An empty
    /// prefix matches everything; a socket with no subscriptions delivers
    /// nothing.
    pub fn subscribe(&self, prefix: &[u8]) {
        self.filters
            .lock()
            .expect("filter list poisoned")
            .push(prefix.to_vec());
    }

    /// The cloneable handle a poll set holds for this socket.
    pub fn poll_item(&self) -> PollItem {
        PollItem {
            rx: self.rx.clone(),
            front: Arc::clone(&self.front),
        }
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.poll_item().recv_now()
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(stream) = self.stream.lock().expect("stream slot poisoned").take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(
    peer: SocketAddr,
    context: Context,
    tx: Sender<Message>,
    filters: Arc<Mutex<Vec<Vec<u8>>>>,
    stream_slot: Arc<Mutex<Option<TcpStream>>>,
    stop: Arc<AtomicBool>,
) {
    let cfg = context.cfg();
    while !stop.load(Ordering::Relaxed) {
        let stream = match TcpStream::connect_timeout(&peer, cfg.connect_timeout) {
            Ok(stream) => stream,
            Err(_) => {
                thread::sleep(cfg.connect_retry);
                continue;
            }
        };
        stream.set_nodelay(true).ok();
        match stream.try_clone() {
            Ok(clone) => *stream_slot.lock().expect("stream slot poisoned") = Some(clone),
            Err(error) => {
                warn!(%peer, %error, "cannot clone subscription stream");
                continue;
            }
        }
        debug!(%peer, "subscription connected");

        let mut reader = BufReader::new(stream);
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            match read_message(&mut reader, cfg.max_frame_bytes) {
                Ok(Some(message)) => {
                    if matches_filter(&filters.lock().expect("filter list poisoned"), &message) {
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    if !stop.load(Ordering::Relaxed) {
                        debug!(%peer, %error, "subscription stream error");
                    }
                    break;
                }
            }
        }
        stream_slot.lock().expect("stream slot poisoned").take();
        thread::sleep(cfg.connect_retry);
    }
}

fn matches_filter(filters: &[Vec<u8>], message: &Message) -> bool {
    let Some(first) = message.frames.first() else {
        return false;
    };
    filters.iter().any(|prefix| first.starts_with(prefix))
}

/// A pollable handle onto one socket's message queue. Clones share the
/// front slot, so a message pulled during `poll` is not lost to the
/// subsequent `recv_now`.
#[derive(Clone)]
pub struct PollItem {
    rx: Receiver<Message>,
    front: Arc<Mutex<VecDeque<Message>>>,
}

impl PollItem {
    #[cfg(test)]
    pub(crate) fn from_channel(rx: Receiver<Message>) -> Self {
        Self {
            rx,
            front: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.front.lock().expect("front queue poisoned").is_empty() || !self.rx.is_empty()
    }

    /// Pop one pending message without blocking.
    pub fn recv_now(&self) -> Option<Message> {
        if let Some(message) = self.front.lock().expect("front queue poisoned").pop_front() {
            return Some(message);
        }
        self.rx.try_recv().ok()
    }
}

/// Report readiness for every item within `timeout`.
///
/// A zero timeout is a non-blocking scan; `None` waits for the first
/// arrival indefinitely. An empty item set sleeps out the wait so callers
/// keep their cadence. A wakeup caused by a closed queue that holds no
/// data is a poll failure.
pub fn poll(items: &[PollItem], timeout: Option<Duration>) -> Result<Vec<bool>, PollError> {
    let mut ready = vec![false; items.len()];
    let mut any = false;
    for (i, item) in items.iter().enumerate() {
        if item.is_ready() {
            ready[i] = true;
            any = true;
        }
    }
    if any || timeout == Some(Duration::ZERO) {
        return Ok(ready);
    }

    if items.is_empty() {
        thread::sleep(timeout.unwrap_or(Duration::from_secs(1)));
        return Ok(ready);
    }

    let mut select = Select::new();
    for item in items {
        select.recv(&item.rx);
    }
    let operation = match timeout {
        Some(wait) => match select.select_timeout(wait) {
            Ok(operation) => operation,
            Err(_) => return Ok(ready),
        },
        None => select.select(),
    };

    let index = operation.index();
    match operation.recv(&items[index].rx) {
        // Park the message in the shared front slot; the owner's process()
        // picks it up via recv_now.
        Ok(message) => items[index]
            .front
            .lock()
            .expect("front queue poisoned")
            .push_back(message),
        Err(_) => return Err(PollError::SocketClosed),
    }

    for (i, item) in items.iter().enumerate() {
        if item.is_ready() {
            ready[i] = true;
        }
    }
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_pair(context: &Context) -> (PubSocket, SubSocket) {
        let publisher = PubSocket::bind(context, "127.0.0.1:0").unwrap();
        let subscriber =
            SubSocket::connect(context, &publisher.local_addr().to_string()).unwrap();
        subscriber.subscribe(b"");
        (publisher, subscriber)
    }

    /// Publish until the message shows up; pub/sub drops everything sent
    /// before the subscriber's connection lands.
    fn send_until_received(publisher: &PubSocket, subscriber: &SubSocket, frames: &[Vec<u8>]) -> Message {
        for _ in 0..200 {
            publisher.send(frames).unwrap();
            thread::sleep(Duration::from_millis(10));
            if let Some(message) = subscriber.try_recv() {
                return message;
            }
        }
        panic!("no message within retry budget");
    }

    #[test]
    fn multipart_round_trip() {
        let context = Context::new();
        let (publisher, subscriber) = connect_pair(&context);

        let frames = vec![b"head".to_vec(), b"payload".to_vec()];
        let message = send_until_received(&publisher, &subscriber, &frames);
        assert_eq!(message.frames, frames);
    }

    #[test]
    fn bind_assigns_port() {
        let context = Context::new();
        let publisher = PubSocket::bind(&context, "127.0.0.1:0").unwrap();
        assert_ne!(publisher.local_addr().port(), 0);
    }

    #[test]
    fn send_without_subscribers_succeeds() {
        let context = Context::new();
        let publisher = PubSocket::bind(&context, "127.0.0.1:0").unwrap();
        publisher.send(&[b"lonely".to_vec()]).unwrap();
    }

    #[test]
    fn filter_blocks_non_matching_prefix() {
        let context = Context::new();
        let publisher = PubSocket::bind(&context, "127.0.0.1:0").unwrap();
        let subscriber =
            SubSocket::connect(&context, &publisher.local_addr().to_string()).unwrap();
        subscriber.subscribe(b"aa");

        // Wait for the connection, observed from the publisher's side.
        for _ in 0..200 {
            if publisher.connection_count() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(publisher.connection_count(), 1);

        publisher.send(&[b"bb-filtered".to_vec()]).unwrap();
        let matching = vec![b"aa-match".to_vec()];
        let message = send_until_received(&publisher, &subscriber, &matching);
        assert_eq!(message.frames, matching);
        // Only retry duplicates may remain; the filtered message never
        // surfaces.
        thread::sleep(Duration::from_millis(50));
        while let Some(extra) = subscriber.try_recv() {
            assert_eq!(extra.frames, matching);
        }
    }

    #[test]
    fn connect_before_bind_recovers() {
        let context = Context::new();
        // Reserve a port, then release it so the subscriber dials a dead
        // address first.
        let placeholder = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = placeholder.local_addr().unwrap();
        drop(placeholder);

        let subscriber = SubSocket::connect(&context, &addr.to_string()).unwrap();
        subscriber.subscribe(b"");
        thread::sleep(Duration::from_millis(50));

        let publisher = PubSocket::bind(&context, &addr.to_string()).unwrap();
        let frames = vec![b"late".to_vec()];
        let message = send_until_received(&publisher, &subscriber, &frames);
        assert_eq!(message.frames, frames);
    }

    #[test]
    fn poll_times_out_with_idle_sockets() {
        let context = Context::new();
        let (_publisher, subscriber) = connect_pair(&context);
        let items = [subscriber.poll_item()];

        let ready = poll(&items, Some(Duration::from_millis(50))).unwrap();
        assert!(ready.iter().all(|&r| !r));
    }

    #[test]
    fn poll_reports_pending_message() {
        let context = Context::new();
        let (publisher, subscriber) = connect_pair(&context);

        send_until_received(&publisher, &subscriber, &[b"warm".to_vec()]);
        thread::sleep(Duration::from_millis(100));
        while subscriber.try_recv().is_some() {}
        publisher.send(&[b"queued".to_vec()]).unwrap();

        let items = [subscriber.poll_item()];
        for _ in 0..200 {
            let ready = poll(&items, Some(Duration::from_millis(10))).unwrap();
            if ready[0] {
                assert_eq!(items[0].recv_now().unwrap().frames, vec![b"queued".to_vec()]);
                return;
            }
        }
        panic!("message never became ready");
    }

    #[test]
    fn poll_front_slot_preserves_messages() {
        let (tx, rx) = unbounded();
        let item = PollItem::from_channel(rx);
        tx.send(Message {
            frames: vec![b"first".to_vec()],
        })
        .unwrap();

        let ready = poll(std::slice::from_ref(&item), Some(Duration::from_millis(10))).unwrap();
        assert!(ready[0]);
        // Whatever poll pulled off the channel must still be deliverable.
        assert_eq!(item.recv_now().unwrap().frames, vec![b"first".to_vec()]);
        assert!(item.recv_now().is_none());
    }

    #[test]
    fn poll_flags_closed_queue() {
        let (tx, rx) = unbounded::<Message>();
        let item = PollItem::from_channel(rx);
        drop(tx);

        let result = poll(std::slice::from_ref(&item), Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(PollError::SocketClosed)));
    }

    #[test]
    fn oversized_frame_is_rejected_on_send() {
        let context = Context::new();
        let publisher = PubSocket::bind(&context, "127.0.0.1:0").unwrap();
        let oversized = vec![0u8; context.cfg().max_frame_bytes + 1];
        assert!(publisher.send(&[oversized]).is_err());
    }

    #[test]
    fn message_codec_round_trips() {
        let frames = vec![b"one".to_vec(), Vec::new(), b"three".to_vec()];
        let mut buffer = Vec::new();
        write_message(&mut buffer, &frames).unwrap();

        let mut cursor = io::Cursor::new(buffer);
        let message = read_message(&mut cursor, 1024).unwrap().unwrap();
        assert_eq!(message.frames, frames);
        assert!(read_message(&mut cursor, 1024).unwrap().is_none());
    }
}
