//! Unix Socket Transport (Hardened)
//!
//! Accepts client connections and feeds their newline-delimited JSON messages
//! into the broker, one message per broker lock.
//!
//! # Security Features
//! - **Socket permissions**: Fixed mode with symlink attack prevention
//! - **Peer credentials**: Audit logging of UID/GID/PID for every connection
//! - **Connection limits**: Maximum concurrent connections enforced
//! - **Timeouts**: A connection must speak within the read timeout; writes are bounded
//! - **Message limits**: Maximum message size prevents memory exhaustion
//!
//! Each connection gets a writer task draining an unbounded queue. The broker
//! only ever queues; once the writer is gone the queue refuses messages and
//! the broker treats the clients on that connection as dead.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use lh_error::{LocHalError, Result};
use lh_protocol::{Indication, MAX_MESSAGE_SIZE};

use crate::broker::SharedBroker;
use crate::client::ClientLink;
use crate::config::DaemonConfig;

// ============================================================================
// Security Constants
// ============================================================================

/// Write timeout per message
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket permissions (0666 = world read/write)
const SOCKET_MODE: u32 = 0o666;

// ============================================================================
// Connection Tracking
// ============================================================================

/// Global connection counter
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Connection ids start at 1; 0 is reserved for detached links
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            // Consume enough to make forward progress, but don't buffer beyond max_len.
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Bind the socket and serve clients until `shutdown` resolves.
pub async fn run_server<F>(config: &DaemonConfig, broker: SharedBroker, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let listener = bind_socket(&config.socket_path)?;
    info!(
        "Security: max_conn={}, max_msg={}, read_timeout={:?}",
        config.max_connections,
        MAX_MESSAGE_SIZE,
        config.read_timeout()
    );

    tokio::pin!(shutdown);
    let read_timeout = config.read_timeout();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        // Check connection limit
                        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
                        if current >= config.max_connections {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                        let broker = broker.clone();
                        let connection = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);

                        tokio::spawn(async move {
                            handle_client(stream, broker, connection, read_timeout).await;
                            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&config.socket_path);
    info!(
        "Server stopped ({} connections still open)",
        ACTIVE_CONNECTIONS.load(Ordering::SeqCst)
    );

    Ok(())
}

fn bind_socket(path: &Path) -> Result<UnixListener> {
    // SECURITY: Remove existing socket only if it's not a symlink
    if let Ok(metadata) = path.symlink_metadata() {
        if metadata.file_type().is_symlink() {
            return Err(LocHalError::invalid_path(
                path,
                "socket path is a symlink - refusing for security",
            ));
        }
        std::fs::remove_file(path)?;
        debug!("Removed existing socket file");
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    info!("Listening on {} (mode {:o})", path.display(), SOCKET_MODE);
    Ok(listener)
}

/// Client credentials from Unix socket peer
#[derive(Debug, Clone, Copy)]
struct PeerCredentials {
    uid: u32,
    gid: u32,
    pid: i32,
}

/// Serve one connection. Any number of clients may be multiplexed on it;
/// the broker binds each to this connection when it registers.
async fn handle_client(stream: UnixStream, broker: SharedBroker, connection: u64, read_timeout: Duration) {
    // Get peer credentials for audit logging
    let cred = match get_peer_credentials(&stream) {
        Some(c) => c,
        None => {
            error!("Failed to get peer credentials, rejecting connection");
            return;
        }
    };

    info!(
        "Connection {} from uid={}, gid={}, pid={}",
        connection, cred.uid, cred.gid, cred.pid
    );

    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let link = ClientLink::connected(connection, tx);
    let writer_task = tokio::spawn(write_indications(writer, rx, connection));

    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);
    let mut message_count: u64 = 0;
    let connection_start = Instant::now();

    loop {
        // Clients idle for long stretches once registered; only the first
        // message is held to the read timeout.
        let read = read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE);
        let read_result = if message_count == 0 {
            match timeout(read_timeout, read).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Read timeout on connection {} (pid={})", connection, cred.pid);
                    break;
                }
            }
        } else {
            read.await
        };

        match read_result {
            Ok(0) => {
                debug!(
                    "Connection {} closed: uid={}, pid={}, messages={}, duration={:?}",
                    connection,
                    cred.uid,
                    cred.pid,
                    message_count,
                    connection_start.elapsed()
                );
                break;
            }
            Ok(n) => {
                message_count += 1;
                trace!("Message #{} on connection {}: {} bytes", message_count, connection, n);

                let line_str = match std::str::from_utf8(&line) {
                    Ok(s) => s.trim_end(),
                    Err(e) => {
                        warn!("Non-UTF8 message on connection {}: {}", connection, e);
                        continue;
                    }
                };
                if line_str.is_empty() {
                    continue;
                }

                broker.lock().await.dispatch(line_str, &link);
            }
            Err(e) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(
                        "Message too large (>{} bytes) on connection {} from uid={}, pid={}",
                        MAX_MESSAGE_SIZE, connection, cred.uid, cred.pid
                    );
                } else {
                    error!("Read error on connection {}: {}", connection, e);
                }
                break;
            }
        }
    }

    // Dropping the queue's receiver makes every later send to this
    // connection fail, which is how the broker learns its clients are gone.
    writer_task.abort();
}

/// Drain queued indications onto the socket until either side closes.
async fn write_indications(
    mut writer: OwnedWriteHalf,
    mut queue: UnboundedReceiver<Indication>,
    connection: u64,
) {
    while let Some(indication) = queue.recv().await {
        let line = match indication.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode {}: {}", indication.type_name(), e);
                continue;
            }
        };

        match timeout(WRITE_TIMEOUT, writer.write_all(line.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write error on connection {}: {}", connection, e);
                break;
            }
            Err(_) => {
                warn!("Write timeout on connection {}", connection);
                break;
            }
        }
    }
    debug!("Writer for connection {} finished", connection);
}

/// Get peer credentials (uid, gid, pid) from Unix socket
fn get_peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    // Linux uses SO_PEERCRED with ucred struct
    #[cfg(target_os = "linux")]
    {
        // SAFETY: ucred is a plain C struct; all-zero is a valid value.
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: fd is a live socket owned by `stream`, and cred/len
        // describe a correctly sized ucred buffer.
        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if result == 0 {
            return Some(PeerCredentials {
                uid: cred.uid,
                gid: cred.gid,
                pid: cred.pid,
            });
        }
    }

    // BSD uses getpeereid (no PID)
    #[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly", target_os = "macos"))]
    {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;

        // SAFETY: fd is a live socket and uid/gid are valid out-pointers.
        let result = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };

        if result == 0 {
            return Some(PeerCredentials { uid, gid, pid: 0 });
        }
    }

    None
}
