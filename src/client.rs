//! Managed handle for one accepted TCP connection.
//!
//! A `ClientHandle` owns the socket's split read/write halves and gates every
//! I/O operation behind a non-blocking liveness poll. A half-open peer (one
//! that died without FIN/RST) would leave a blocking read pending forever;
//! the poll detects that class of failure before the transport is touched.
//!
//! Disconnect is idempotent and may be triggered from any of four places:
//! remote close, read/write failure, a poll that finds the socket dead, or an
//! external caller. Whichever trigger wins the internal guard performs the
//! teardown and fires the disconnect observers exactly once.

use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A poll within this window of the previous one returns the cached result
/// instead of re-probing the OS.
const POLL_CACHE_WINDOW: Duration = Duration::from_millis(500);

/// Delay before the single write retry.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Process-wide client id counter.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Key namespace for disconnect observers.
static NEXT_OBSERVER_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique key for [`ClientHandle::subscribe_disconnect`].
pub fn allocate_observer_key() -> u64 {
    NEXT_OBSERVER_KEY.fetch_add(1, Ordering::Relaxed)
}

/// Errors surfaced by client I/O operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Callback invoked exactly once when the handle disconnects.
pub type DisconnectObserver = Box<dyn Fn(&ClientHandle) + Send + Sync>;

#[derive(Debug)]
struct HandleState {
    connected: bool,
    disconnecting: bool,
    last_poll: Option<Instant>,
    last_poll_result: bool,
    last_activity: DateTime<Utc>,
}

/// Managed connection handle. See the module docs for the I/O contract.
pub struct ClientHandle {
    id: u64,
    addr: SocketAddr,
    host: String,
    name: String,
    connected_at: DateTime<Utc>,
    fd: RawFd,
    state: Mutex<HandleState>,
    observers: Mutex<Vec<(u64, DisconnectObserver)>>,
    reader: tokio::sync::Mutex<BufReader<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl ClientHandle {
    /// Wrap an accepted stream. `host` is the reverse-DNS name when the
    /// lookup succeeded; otherwise the handle falls back to the IP string.
    pub fn new(stream: TcpStream, host: Option<String>) -> io::Result<Arc<Self>> {
        let addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let fd = stream.as_raw_fd();
        let (read_half, write_half) = stream.into_split();

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let host = host.unwrap_or_else(|| addr.ip().to_string());
        let name = format!("client-{id}@{addr}::{host}");
        let now = Utc::now();

        Ok(Arc::new(Self {
            id,
            addr,
            host,
            name,
            connected_at: now,
            fd,
            state: Mutex::new(HandleState {
                connected: true,
                disconnecting: false,
                last_poll: None,
                last_poll_result: true,
                last_activity: now,
            }),
            observers: Mutex::new(Vec::new()),
            reader: tokio::sync::Mutex::new(BufReader::new(read_half)),
            writer: tokio::sync::Mutex::new(write_half),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state.lock().expect("mutex poisoned").last_activity
    }

    /// Cached connection flag, refreshed by the liveness poll and cleared on
    /// disconnect.
    pub fn is_connected(&self) -> bool {
        self.state.lock().expect("mutex poisoned").connected
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state.lock().expect("mutex poisoned").disconnecting
    }

    /// Gate for every I/O operation: not already tearing down, and the
    /// socket still looks alive.
    pub fn is_safe_to_proceed(&self) -> bool {
        !self.is_disconnecting() && self.poll_liveness()
    }

    /// Read one newline-terminated line.
    ///
    /// `Ok(Some(line))` is a live line with the terminator stripped; a blank
    /// line is valid. `Ok(None)` means the connection ended normally (remote
    /// close, or the liveness gate refused the read) and the handle is
    /// already disconnecting. `Err` is an I/O failure, also terminal.
    pub async fn read_line(&self) -> Result<Option<String>, ClientError> {
        if !self.is_safe_to_proceed() {
            self.disconnect();
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!(client = %self, "remote peer closed the connection");
                self.disconnect();
                Ok(None)
            }
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                self.touch();
                Ok(Some(line))
            }
            Err(e) => {
                warn!(client = %self, error = %e, "read failed");
                self.disconnect();
                Err(e.into())
            }
        }
    }

    /// Write raw text, retrying exactly once after a short delay if the
    /// first attempt fails. Liveness is re-checked before the retry.
    pub async fn write(&self, message: &str) -> Result<(), ClientError> {
        if !self.is_safe_to_proceed() {
            self.disconnect();
            return Err(ClientError::NotConnected);
        }

        let first = {
            let mut writer = self.writer.lock().await;
            writer.write_all(message.as_bytes()).await
        };
        let first_err = match first {
            Ok(()) => {
                self.touch();
                return Ok(());
            }
            Err(e) => e,
        };

        info!(client = %self, error = %first_err, "write failed, retrying once");
        tokio::time::sleep(WRITE_RETRY_DELAY).await;

        if !self.is_safe_to_proceed() {
            info!(client = %self, "client unreachable after retry delay");
            self.disconnect();
            return Err(first_err.into());
        }

        let retry = {
            let mut writer = self.writer.lock().await;
            writer.write_all(message.as_bytes()).await
        };
        match retry {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(e) => {
                warn!(client = %self, error = %e, "write failed after retry");
                self.disconnect();
                Err(e.into())
            }
        }
    }

    /// Write one line, appending the terminator.
    pub async fn write_line(&self, message: &str) -> Result<(), ClientError> {
        self.write(&format!("{message}\n")).await
    }

    /// Tear the connection down. Idempotent: only the first caller performs
    /// the teardown and notifies observers; later callers return at once.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock().expect("mutex poisoned");
            if state.disconnecting {
                return;
            }
            state.disconnecting = true;
            state.connected = false;
        }

        let uptime = Utc::now().signed_duration_since(self.connected_at);
        info!(client = %self, uptime_secs = uptime.num_seconds(), "disconnecting client");

        // Shut the socket down in both directions. This unblocks a session
        // loop parked in read_line; the fd itself is released when the handle
        // drops. Shutdown failure is logged, never propagated.
        let sock = unsafe { BorrowedFd::borrow_raw(self.fd) };
        if let Err(e) = socket2::SockRef::from(&sock).shutdown(std::net::Shutdown::Both) {
            debug!(client = %self, error = %e, "socket shutdown failed");
        }

        let observers = {
            let mut observers = self.observers.lock().expect("mutex poisoned");
            std::mem::take(&mut *observers)
        };
        for (_, notify) in &observers {
            notify(self);
        }
    }

    /// Non-blocking liveness check. Readable with zero available bytes means
    /// the peer is gone; a live socket must also be accepting writes.
    ///
    /// Throttled: a poll within [`POLL_CACHE_WINDOW`] of the previous one
    /// returns the cached result without a syscall. A fresh probe also
    /// refreshes the cached `connected` flag.
    pub fn poll_liveness(&self) -> bool {
        let mut state = self.state.lock().expect("mutex poisoned");
        if state.disconnecting {
            return false;
        }
        if let Some(last) = state.last_poll {
            if last.elapsed() < POLL_CACHE_WINDOW {
                return state.last_poll_result;
            }
        }

        let alive = probe_socket(self.fd);
        state.last_poll = Some(Instant::now());
        state.last_poll_result = alive;
        state.connected = alive;
        alive
    }

    /// Register a disconnect observer under `key`. A key that is already
    /// subscribed is left as-is. Returns false if the handle is already
    /// disconnecting, in which case the observer will never fire.
    pub fn subscribe_disconnect(&self, key: u64, observer: DisconnectObserver) -> bool {
        let mut observers = self.observers.lock().expect("mutex poisoned");
        if self.is_disconnecting() {
            return false;
        }
        if observers.iter().any(|(k, _)| *k == key) {
            return true;
        }
        observers.push((key, observer));
        true
    }

    pub fn unsubscribe_disconnect(&self, key: u64) {
        self.observers
            .lock()
            .expect("mutex poisoned")
            .retain(|(k, _)| *k != key);
    }

    fn touch(&self) {
        self.state.lock().expect("mutex poisoned").last_activity = Utc::now();
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("host", &self.host)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Probe the socket without blocking. A peek that returns zero bytes on a
/// readable socket means the peer closed or died; a live socket must also
/// report `POLLOUT` with no error flags.
fn probe_socket(fd: RawFd) -> bool {
    let sock = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = socket2::SockRef::from(&sock);

    let mut buf = [MaybeUninit::<u8>::uninit()];
    match sock.peek(&mut buf) {
        Ok(0) => return false,
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(_) => return false,
    }

    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
    rc >= 0
        && pollfd.revents & libc::POLLOUT != 0
        && pollfd.revents & (libc::POLLERR | libc::POLLHUP) == 0
}
