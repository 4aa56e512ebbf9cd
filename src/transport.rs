#![allow(clippy::significant_drop_tightening, clippy::needless_continue)]
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::oneshot;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout as tokio_timeout};

use crate::config::{config as global_config, Config};
use crate::endpoint::ConnectionTarget;
use crate::error::ModbusError;
use crate::mbap::{detect_frame, hex_dump};

// Waiters in send order, keyed by transaction id
type Pending = Arc<Mutex<VecDeque<(u16, oneshot::Sender<Vec<u8>>)>>>;

fn lock_pending(p: &Pending) -> std::sync::MutexGuard<'_, VecDeque<(u16, oneshot::Sender<Vec<u8>>)>> {
    p.lock().unwrap_or_else(PoisonError::into_inner)
}

fn maybe_log_frame(label: &str, frame: &[u8]) {
    if global_config().log_frames {
        log::debug!("[MODBUS {label}] {}", hex_dump(frame));
    }
}

/// One established client connection. Requests may be issued concurrently;
/// a background task reads the socket and hands every response frame to the
/// waiter with the matching transaction id.
#[derive(Debug)]
pub struct Connection {
    writer: TokioMutex<OwnedWriteHalf>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    peer: SocketAddr,
}

/// Removes the waiter slot when a request is finished or its future dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    transaction_id: u16,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut p = lock_pending(self.pending);
        if let Some(pos) = p.iter().position(|(tid, _)| *tid == self.transaction_id) {
            let _ = p.remove(pos);
        }
    }
}

impl Connection {
    /// Resolve `target` and connect to the first address that accepts.
    ///
    /// # Errors
    ///
    /// `Io` for resolution or connect failures, `Timeout` when no address
    /// answered within `connect_timeout`.
    pub async fn open(target: &ConnectionTarget, connect_timeout: Duration) -> Result<Self, ModbusError> {
        let mut last_err = ModbusError::NoConnection;
        for remote in lookup_host(target.addr.as_str()).await? {
            match tokio_timeout(connect_timeout, TcpStream::connect(remote)).await {
                Ok(Ok(stream)) => return Ok(Self::from_stream(stream, remote)),
                Ok(Err(e)) => last_err = ModbusError::Io(e),
                Err(_) => last_err = ModbusError::Timeout,
            }
        }
        Err(last_err)
    }

    /// [`Self::open`] with retries and exponential backoff per `cfg`.
    ///
    /// # Errors
    ///
    /// The error of the last attempt.
    pub async fn open_with_retry(target: &ConnectionTarget, cfg: &Config) -> Result<Self, ModbusError> {
        let attempts = cfg.connect_retry_attempts.max(1);
        let mut last_err = ModbusError::NoConnection;
        for attempt in 1..=attempts {
            match Self::open(target, cfg.connect_timeout()).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    log::warn!(
                        "[MODBUS RETRY] connect attempt {attempt}/{attempts} to {} failed: {e}",
                        target.addr
                    );
                    last_err = e;
                    if attempt == attempts {
                        break;
                    }
                    let exp = u32::try_from(attempt.saturating_sub(1).min(16)).unwrap_or(16);
                    let backoff = cfg.connect_retry_backoff_ms.saturating_mul(2u64.pow(exp));
                    sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
        Err(last_err)
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay on {peer} failed: {e}");
        }
        let (mut rd, wr) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(VecDeque::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = {
            let pending = pending.clone();
            let alive = alive.clone();
            tokio::spawn(async move {
                let mut buf: Vec<u8> = Vec::new();
                let mut tmp = [0u8; 1024];
                'read: loop {
                    let n = match rd.read(&mut tmp).await {
                        Ok(0) => {
                            log::debug!("server {peer} closed the connection");
                            break;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            log::warn!("read from {peer} failed: {e}");
                            break;
                        }
                    };
                    buf.extend_from_slice(&tmp[..n]);
                    loop {
                        match detect_frame(&buf) {
                            Ok(Some(len)) if buf.len() >= len => {
                                let frame: Vec<u8> = buf.drain(..len).collect();
                                maybe_log_frame("recv", &frame);
                                route(&pending, frame);
                            }
                            Ok(_) => break,
                            Err(e) => {
                                log::error!("unframeable data from {peer}: {e}");
                                break 'read;
                            }
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // dropping the senders wakes every waiter with NoConnection
                lock_pending(&pending).clear();
            })
        };
        Self {
            writer: TokioMutex::new(wr),
            pending,
            alive,
            reader,
            peer,
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send `frame` and wait for the response frame routed to `transaction_id`.
    ///
    /// # Errors
    ///
    /// `NoConnection` when the connection is (or goes) down, `Timeout` when
    /// nothing arrives within `timeout`, `Io` when the write fails.
    pub async fn request(&self, transaction_id: u16, frame: &[u8], timeout: Duration) -> Result<Vec<u8>, ModbusError> {
        if !self.is_alive() {
            return Err(ModbusError::NoConnection);
        }
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).push_back((transaction_id, tx));
        let _guard = PendingGuard {
            pending: &self.pending,
            transaction_id,
        };
        {
            let mut w = self.writer.lock().await;
            let res = match tokio_timeout(timeout, w.write_all(frame)).await {
                Ok(r) => r.map_err(ModbusError::Io),
                Err(_) => Err(ModbusError::Timeout),
            };
            if let Err(e) = res {
                self.alive.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        maybe_log_frame("send", frame);
        match tokio_timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(ModbusError::NoConnection),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        lock_pending(&self.pending).clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// A frame whose transaction id nobody waits for goes to the oldest waiter,
// which then reports the mismatch.
fn route(pending: &Pending, frame: Vec<u8>) {
    let tid = u16::from_be_bytes([frame[0], frame[1]]);
    let mut p = lock_pending(pending);
    let slot = p
        .iter()
        .position(|(t, _)| *t == tid)
        .or_else(|| (!p.is_empty()).then_some(0));
    match slot.and_then(|pos| p.remove(pos)) {
        Some((_, tx)) => {
            let _ = tx.send(frame);
        }
        None => log::warn!("dropping unsolicited response tid={tid}"),
    }
}
