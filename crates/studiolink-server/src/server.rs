//! The discovery server.
//!
//! Every websocket client gets a fresh peer id. Once a client registers its
//! role it receives the current listing and becomes visible to everyone
//! else; from then on the server broadcasts additions, removals and
//! metadata changes, and forwards relay payloads between clients without
//! looking inside them.

use crate::error::ServerResult;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use studiolink_types::config::ServerConfig;
use studiolink_types::{AvailablePeer, ClientRole, PeerId, ProjectMetadata};
use studiolink_wire::{ClientOp, ServerOp};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

struct Client {
    role: Option<ClientRole>,
    metadata: Option<ProjectMetadata>,
    outbound: mpsc::UnboundedSender<ServerOp>,
}

impl Client {
    fn listing(&self, id: &PeerId) -> Option<AvailablePeer> {
        self.role.map(|role| AvailablePeer {
            id: id.clone(),
            role,
            project_metadata: self.metadata.clone(),
        })
    }
}

struct ServerState {
    clients: DashMap<PeerId, Client>,
    max_message_size: usize,
}

impl ServerState {
    fn send_to(&self, id: &PeerId, op: ServerOp) -> bool {
        match self.clients.get(id) {
            Some(client) => client.outbound.send(op).is_ok(),
            None => false,
        }
    }

    /// Send to every registered client except `except`.
    fn broadcast(&self, except: &PeerId, op: &ServerOp) {
        for entry in self.clients.iter() {
            if entry.key() != except && entry.role.is_some() {
                let _ = entry.outbound.send(op.clone());
            }
        }
    }

    fn listings_except(&self, except: &PeerId) -> Vec<AvailablePeer> {
        self.clients
            .iter()
            .filter(|entry| entry.key() != except)
            .filter_map(|entry| entry.listing(entry.key()))
            .collect()
    }

    fn handle_op(&self, id: &PeerId, op: ClientOp) {
        match op {
            ClientOp::RegisterClient { role } => {
                let listing = {
                    let Some(mut client) = self.clients.get_mut(id) else {
                        return;
                    };
                    client.role = Some(role);
                    client.listing(id)
                };
                info!(peer_id = %id, role = %role, "Client registered");
                self.send_to(
                    id,
                    ServerOp::SetAvailableConnections {
                        connections: self.listings_except(id),
                    },
                );
                if let Some(connection) = listing {
                    self.broadcast(id, &ServerOp::AddAvailableConnection { connection });
                }
            }
            ClientOp::SetProjectMetadata { metadata } => {
                let registered = {
                    let Some(mut client) = self.clients.get_mut(id) else {
                        return;
                    };
                    client.metadata = metadata.clone();
                    client.role.is_some()
                };
                debug!(peer_id = %id, "Project metadata updated");
                if registered {
                    self.broadcast(
                        id,
                        &ServerOp::SetConnectionProjectMetadata {
                            id: id.clone(),
                            metadata,
                        },
                    );
                }
            }
            ClientOp::RelayMessage { to_peer_id, data } => {
                let op = ServerOp::RelayMessage {
                    from_peer_id: id.clone(),
                    data,
                };
                if !self.send_to(&to_peer_id, op) {
                    debug!(from = %id, to = %to_peer_id, "Dropping relay to unknown peer");
                }
            }
        }
    }

    fn remove(&self, id: &PeerId) {
        let Some((_, client)) = self.clients.remove(id) else {
            return;
        };
        info!(peer_id = %id, "Client disconnected");
        if client.role.is_some() {
            self.broadcast(id, &ServerOp::RemoveAvailableConnection { id: id.clone() });
        }
    }
}

/// A running discovery server.
pub struct DiscoveryServer {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: watch::Sender<bool>,
}

impl DiscoveryServer {
    /// Bind to `config.listen_addr` and start accepting clients.
    pub async fn start(
        config: &ServerConfig,
    ) -> ServerResult<(Arc<Self>, JoinHandle<()>)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Discovery server listening");

        let state = Arc::new(ServerState {
            clients: DashMap::new(),
            max_message_size: config.max_message_size,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(Self {
            local_addr,
            state: state.clone(),
            shutdown_tx,
        });

        let handle = tokio::spawn(accept_loop(listener, state, shutdown_rx));
        Ok((server, handle))
    }

    /// The bound address; differs from the configured one when binding to
    /// port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Connected clients, registered or not.
    pub fn client_count(&self) -> usize {
        self.state.clients.len()
    }

    pub fn registered_count(&self) -> usize {
        self.state
            .clients
            .iter()
            .filter(|entry| entry.role.is_some())
            .count()
    }

    /// Stop accepting and close every client connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted connection");
                    let state = state.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, state, shutdown_rx).await {
                            debug!(%addr, error = %e, "Client connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Discovery server shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ServerResult<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let id = PeerId::random();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    state.clients.insert(
        id.clone(),
        Client {
            role: None,
            metadata: None,
            outbound,
        },
    );
    debug!(peer_id = %id, "Client connected");

    let result = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                };
                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => break Ok(()),
                    _ => continue,
                };
                if text.len() > state.max_message_size {
                    warn!(
                        peer_id = %id,
                        size = text.len(),
                        max = state.max_message_size,
                        "Dropping oversized message"
                    );
                    continue;
                }
                match serde_json::from_str::<ClientOp>(&text) {
                    Ok(op) => state.handle_op(&id, op),
                    Err(e) => warn!(peer_id = %id, error = %e, "Failed to parse client message"),
                }
            }
            Some(op) = outbound_rx.recv() => {
                let text = match serde_json::to_string(&op) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(peer_id = %id, error = %e, "Failed to encode server op");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    break Err(e.into());
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = ws_tx.close().await;
                    break Ok(());
                }
            }
        }
    };

    state.remove(&id);
    result
}
