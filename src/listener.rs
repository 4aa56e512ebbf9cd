//! TCP front end for [`ServerEngine`]: one task per accepted connection.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout as tokio_timeout;

use crate::config::config as global_config;
use crate::error::ModbusError;
use crate::mbap::{detect_frame, MAX_LENGTH_FIELD, MBAP_HEADER_LEN};
use crate::server::ServerEngine;
use crate::store::RegisterStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Serving,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub state: ConnectionState,
}

#[derive(Debug)]
struct Shared {
    engine: ServerEngine,
    state: Mutex<ListenerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: Mutex<BTreeMap<u64, ConnectionInfo>>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_conn_state(&self, id: u64, state: ConnectionState) {
        let mut conns = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = conns.get_mut(&id) {
            c.state = state;
        }
    }
}

/// Modbus/TCP server bound to one [`RegisterStore`]. Cheap to clone; all
/// clones control the same listener.
#[derive(Debug, Clone)]
pub struct ModbusServer {
    shared: Arc<Shared>,
}

impl ModbusServer {
    #[must_use]
    pub fn new(store: RegisterStore) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                engine: ServerEngine::new(store),
                state: Mutex::new(ListenerState::Idle),
                local_addr: Mutex::new(None),
                connections: Mutex::new(BTreeMap::new()),
                shutdown,
                next_id: AtomicU64::new(1),
                accept_task: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &RegisterStore {
        self.shared.engine.store()
    }

    /// Bind `0.0.0.0:port` and start accepting. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// `Io` when the port cannot be bound, `Protocol` when the server is not
    /// idle.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ModbusError> {
        self.ensure_idle()?;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        self.run_listener_on(listener)
    }

    /// Serve an already bound listener.
    ///
    /// # Errors
    ///
    /// `Protocol` when the server is not idle, `Io` when the listener has no
    /// local address.
    pub fn run_listener_on(&self, listener: TcpListener) -> Result<SocketAddr, ModbusError> {
        self.ensure_idle()?;
        let addr = listener.local_addr()?;
        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) = ListenerState::Listening;
        tracing::info!(%addr, "modbus server listening");

        let shared = self.shared.clone();
        let handle = tokio::spawn(accept_loop(shared, listener));
        *self.shared.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(addr)
    }

    /// Stop accepting and terminate every connection task.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ListenerState::Closed {
                return;
            }
            *state = ListenerState::Closed;
        }
        self.shared.shutdown.send_replace(true);
        if let Some(task) = self.shared.accept_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        tracing::info!(addr = ?self.local_addr(), "modbus server closed");
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the open connections.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn ensure_idle(&self) -> Result<(), ModbusError> {
        let state = self.state();
        if state == ListenerState::Idle {
            Ok(())
        } else {
            Err(ModbusError::Protocol(format!("server is {state:?}, expected Idle")))
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                    shared
                        .connections
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id, ConnectionInfo { id, peer, state: ConnectionState::Accepted });
                    tracing::info!(conn_id = id, %peer, "connection accepted");
                    tokio::spawn(serve_connection(shared.clone(), stream, peer, id));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn serve_connection(shared: Arc<Shared>, mut stream: TcpStream, peer: SocketAddr, id: u64) {
    let mut shutdown = shared.shutdown.subscribe();
    shared.set_conn_state(id, ConnectionState::Serving);
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(conn_id = id, %peer, error = %e, "set_nodelay failed");
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; MBAP_HEADER_LEN + MAX_LENGTH_FIELD];
    let reason = loop {
        if *shutdown.borrow() {
            break "server shutdown";
        }
        // an idle connection may wait forever; a half-received frame may not
        let read = async {
            if buf.is_empty() {
                Some(stream.read(&mut tmp).await)
            } else {
                tokio_timeout(global_config().response_timeout(), stream.read(&mut tmp))
                    .await
                    .ok()
            }
        };
        let n = tokio::select! {
            _ = shutdown.changed() => break "server shutdown",
            r = read => match r {
                None => break "incomplete frame timed out",
                Some(Ok(0)) => break "peer closed",
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    tracing::warn!(conn_id = id, %peer, error = %e, "read failed");
                    break "read error";
                }
            }
        };
        buf.extend_from_slice(&tmp[..n]);

        // serve every complete frame now in the buffer, in arrival order
        let mut ready = 0;
        let mut framing_error = None;
        loop {
            match detect_frame(&buf[ready..]) {
                Ok(Some(len)) if buf.len() - ready >= len => ready += len,
                Ok(_) => break,
                Err(e) => {
                    framing_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = framing_error {
            tracing::warn!(conn_id = id, %peer, error = %e, "malformed header");
            break "malformed header";
        }
        if ready == 0 {
            continue;
        }
        let chunk: Vec<u8> = buf.drain(..ready).collect();
        let response = shared.engine.handle(&chunk);
        if response.is_empty() {
            break "unparseable request";
        }
        if let Err(e) = stream.write_all(&response).await {
            tracing::warn!(conn_id = id, %peer, error = %e, "write failed");
            break "write error";
        }
    };

    shared.set_conn_state(id, ConnectionState::Closed);
    let _ = stream.shutdown().await;
    shared
        .connections
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    tracing::info!(conn_id = id, %peer, reason, "connection closed");
}
