//! Local broker discovery.
//!
//! A [`LocalBroker`] is a task that every peer in a process group attaches
//! to. It knows which attached clients have registered, tells each of them
//! about the others, and on a connection request mints a port pair and
//! hands one end to each side.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::method::{DiscoveryKind, DiscoveryMethod};
use crate::state::{ActiveConnection, DiscoveryCore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use studiolink_transport::{port_pair, LocalBrokerTransport, LocalPort, Transport};
use studiolink_types::{
    AvailablePeer, ClientRole, PeerId, ProjectMetadata, ProtocolViolation, RequestData,
};
use studiolink_wire::EngineConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum BrokerCommand {
    Attach {
        events: mpsc::UnboundedSender<BrokerEvent>,
        reply: oneshot::Sender<PeerId>,
    },
    Register {
        client: PeerId,
        role: ClientRole,
    },
    SetMetadata {
        client: PeerId,
        metadata: Option<ProjectMetadata>,
    },
    RequestConnection {
        from: PeerId,
        to: PeerId,
        data: RequestData,
        reply: oneshot::Sender<DiscoveryResult<LocalPort>>,
    },
    Detach {
        client: PeerId,
    },
}

/// What the broker tells an attached client.
#[derive(Debug)]
pub enum BrokerEvent {
    SetAvailable(Vec<AvailablePeer>),
    Add(AvailablePeer),
    Remove(PeerId),
    Metadata {
        id: PeerId,
        metadata: Option<ProjectMetadata>,
    },
    /// Another client connected to this one; `port` is this side's end.
    IncomingConnection {
        from: PeerId,
        data: RequestData,
        port: LocalPort,
    },
}

struct BrokerClient {
    events: mpsc::UnboundedSender<BrokerEvent>,
    role: Option<ClientRole>,
    metadata: Option<ProjectMetadata>,
}

impl BrokerClient {
    fn listing(&self, id: &PeerId) -> Option<AvailablePeer> {
        self.role.map(|role| AvailablePeer {
            id: id.clone(),
            role,
            project_metadata: self.metadata.clone(),
        })
    }
}

/// Handle to a running broker. Cheap to clone.
#[derive(Clone)]
pub struct LocalBroker {
    commands: mpsc::UnboundedSender<BrokerCommand>,
}

impl LocalBroker {
    /// Start a broker task. Must be called within a tokio runtime.
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_broker(rx));
        Self { commands }
    }

    fn command(&self, command: BrokerCommand) -> DiscoveryResult<()> {
        self.commands
            .send(command)
            .map_err(|_| DiscoveryError::Closed)
    }
}

async fn run_broker(mut commands: mpsc::UnboundedReceiver<BrokerCommand>) {
    let mut clients: BTreeMap<PeerId, BrokerClient> = BTreeMap::new();
    info!("Local broker started");

    while let Some(command) = commands.recv().await {
        match command {
            BrokerCommand::Attach { events, reply } => {
                let id = PeerId::random();
                debug!(client = %id, "Client attached to broker");
                clients.insert(
                    id.clone(),
                    BrokerClient {
                        events,
                        role: None,
                        metadata: None,
                    },
                );
                let _ = reply.send(id);
            }
            BrokerCommand::Register { client, role } => {
                let Some(entry) = clients.get_mut(&client) else {
                    continue;
                };
                entry.role = Some(role);
                debug!(client = %client, %role, "Client registered with broker");

                let others: Vec<AvailablePeer> = clients
                    .iter()
                    .filter(|(id, _)| **id != client)
                    .filter_map(|(id, c)| c.listing(id))
                    .collect();
                if let Some(entry) = clients.get(&client) {
                    let _ = entry.events.send(BrokerEvent::SetAvailable(others));
                }
                if let Some(listing) = clients.get(&client).and_then(|c| c.listing(&client)) {
                    broadcast(&clients, &client, || BrokerEvent::Add(listing.clone()));
                }
            }
            BrokerCommand::SetMetadata { client, metadata } => {
                let Some(entry) = clients.get_mut(&client) else {
                    continue;
                };
                entry.metadata = metadata.clone();
                if entry.role.is_some() {
                    broadcast(&clients, &client, || BrokerEvent::Metadata {
                        id: client.clone(),
                        metadata: metadata.clone(),
                    });
                }
            }
            BrokerCommand::RequestConnection {
                from,
                to,
                data,
                reply,
            } => {
                let registered = |id: &PeerId| clients.get(id).is_some_and(|c| c.role.is_some());
                if !registered(&from) || !registered(&to) || from == to {
                    let _ = reply.send(Err(ProtocolViolation::UnknownPeer(to).into()));
                    continue;
                }
                let (mine, theirs) = port_pair();
                let delivered = clients.get(&to).is_some_and(|target| {
                    target
                        .events
                        .send(BrokerEvent::IncomingConnection {
                            from: from.clone(),
                            data,
                            port: theirs,
                        })
                        .is_ok()
                });
                if delivered {
                    debug!(from = %from, to = %to, "Broker linked two clients");
                    let _ = reply.send(Ok(mine));
                } else {
                    let _ = reply.send(Err(DiscoveryError::Rejected(format!(
                        "peer {to} is no longer attached"
                    ))));
                }
            }
            BrokerCommand::Detach { client } => {
                if let Some(entry) = clients.remove(&client) {
                    debug!(client = %client, "Client detached from broker");
                    if entry.role.is_some() {
                        broadcast(&clients, &client, || BrokerEvent::Remove(client.clone()));
                    }
                }
            }
        }
    }
    info!("Local broker stopped");
}

/// Send an event to every registered client except `except`.
fn broadcast(
    clients: &BTreeMap<PeerId, BrokerClient>,
    except: &PeerId,
    event: impl Fn() -> BrokerEvent,
) {
    for (id, client) in clients {
        if id != except && client.role.is_some() && client.events.send(event()).is_err() {
            warn!(client = %id, "Broker client stopped listening");
        }
    }
}

/// A [`DiscoveryMethod`] backed by a [`LocalBroker`].
pub struct BrokerDiscovery {
    core: Arc<DiscoveryCore>,
    broker: LocalBroker,
    client_id: PeerId,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerDiscovery {
    /// Attach to `broker`. The client stays invisible to others until
    /// [`DiscoveryMethod::register_client`] is called.
    pub async fn attach(
        broker: &LocalBroker,
        engine_config: EngineConfig,
    ) -> Result<Arc<Self>, DiscoveryError> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (reply, client_id) = oneshot::channel();
        broker.command(BrokerCommand::Attach {
            events: events_tx,
            reply,
        })?;
        let client_id = client_id.await.map_err(|_| DiscoveryError::Closed)?;

        let discovery = Arc::new(Self {
            core: DiscoveryCore::new(DiscoveryKind::LocalBroker, engine_config),
            broker: broker.clone(),
            client_id,
            pump: Mutex::new(None),
        });

        let core = Arc::downgrade(&discovery.core);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(core) = core.upgrade() else {
                    return;
                };
                apply_event(&core, event);
            }
        });
        *discovery.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
        Ok(discovery)
    }

    /// The id the broker assigned to this client.
    pub fn client_id(&self) -> &PeerId {
        &self.client_id
    }
}

fn apply_event(core: &DiscoveryCore, event: BrokerEvent) {
    match event {
        BrokerEvent::SetAvailable(peers) => core.set_available_connections(&peers),
        BrokerEvent::Add(peer) => core.add_available_connection(&peer),
        BrokerEvent::Remove(id) => {
            core.remove_available_connection(&id);
        }
        BrokerEvent::Metadata { id, metadata } => core.set_connection_project_metadata(&id, metadata),
        BrokerEvent::IncomingConnection { from, data, port } => {
            let config = core.engine_config().clone();
            let result = core.add_active_connection(&from, false, data, |peer| {
                let transport: Arc<dyn Transport> =
                    LocalBrokerTransport::new(peer.id.clone(), port, config);
                Ok(transport)
            });
            if let Err(e) = result {
                error!(peer_id = %from, error = %e, "Dropping incoming broker connection");
            }
        }
    }
}

#[async_trait]
impl DiscoveryMethod for BrokerDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::LocalBroker
    }

    fn core(&self) -> &Arc<DiscoveryCore> {
        &self.core
    }

    async fn register_client(&self, role: ClientRole) -> DiscoveryResult<()> {
        self.broker.command(BrokerCommand::Register {
            client: self.client_id.clone(),
            role,
        })
    }

    async fn set_project_metadata(
        &self,
        metadata: Option<ProjectMetadata>,
    ) -> DiscoveryResult<()> {
        self.broker.command(BrokerCommand::SetMetadata {
            client: self.client_id.clone(),
            metadata,
        })
    }

    async fn request_connection(
        &self,
        peer_id: &PeerId,
        data: RequestData,
    ) -> DiscoveryResult<ActiveConnection> {
        if self.core.available(peer_id).is_none() {
            error!(peer_id = %peer_id, "Connection requested to a peer that is not available");
            return Err(ProtocolViolation::UnknownPeer(peer_id.clone()).into());
        }
        let (reply, port) = oneshot::channel();
        self.broker.command(BrokerCommand::RequestConnection {
            from: self.client_id.clone(),
            to: peer_id.clone(),
            data: data.clone(),
            reply,
        })?;
        let port = port.await.map_err(|_| DiscoveryError::Closed)??;

        let config = self.core.engine_config().clone();
        self.core
            .add_active_connection(peer_id, true, data, |peer| {
                let transport: Arc<dyn Transport> =
                    LocalBrokerTransport::new(peer.id.clone(), port, config);
                Ok(transport)
            })
    }

    async fn shutdown(&self) {
        let _ = self.broker.command(BrokerCommand::Detach {
            client: self.client_id.clone(),
        });
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        self.core.close_all();
        self.core.clear_available_connections();
    }
}

impl Drop for BrokerDiscovery {
    fn drop(&mut self) {
        let _ = self.broker.command(BrokerCommand::Detach {
            client: self.client_id.clone(),
        });
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }
}
