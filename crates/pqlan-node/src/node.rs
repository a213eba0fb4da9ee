//! Node runtime: connection management and the embedding API.
//!
//! A [`Node`] owns the shared state every connection task needs:
//!
//! - the identity store (trust table, internally locked)
//! - the group manager, behind a mutex that is never held across `.await`
//! - one command channel per connected peer
//!
//! Everything the application needs to know arrives on the [`NodeEvent`]
//! channel returned by [`Node::new`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use pqlan_core::{
    Environment, GroupConfig, GroupEpoch, GroupError, GroupId, GroupKeyCourier, GroupManager,
    Handshake, HandshakeAction, HandshakeConfig, Identity, IdentityStore, RejectReason, Role,
    Session, TrustStorage, should_initiate,
};
use pqlan_crypto::Fingerprint;
use pqlan_proto::InnerMessage;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    error::NodeError,
    peer::{PeerCommand, drive_handshake, run_session},
    system_env::SystemEnv,
    transport::{DEFAULT_MAX_FRAME_LEN, FramedTransport, Transport},
};

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Handshake timeout and session limits
    pub handshake: HandshakeConfig,
    /// Retired epoch retention
    pub group: GroupConfig,
    /// Queued commands per peer before group sends start dropping
    pub command_buffer: usize,
    /// Queued events before connection tasks wait on the application
    pub event_buffer: usize,
    /// How often retired group epochs are pruned
    pub tick_interval: Duration,
    /// Largest frame accepted from a TCP peer
    pub max_frame_len: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            group: GroupConfig::default(),
            command_buffer: 64,
            event_buffer: 256,
            tick_interval: Duration::from_secs(1),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// What the node reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Handshake completed; messages can flow
    PeerConnected {
        /// Authenticated peer
        peer: Fingerprint,
    },
    /// Handshake failed. Only the opaque reason is reported
    PeerRejected {
        /// Peer, if its signature had verified before the failure
        peer: Option<Fingerprint>,
        /// What to show the user
        reason: RejectReason,
    },
    /// Session ended
    PeerDisconnected {
        /// Former peer
        peer: Fingerprint,
        /// Goodbye reason or the error that ended the session
        reason: Option<String>,
    },
    /// Application data from a peer
    Message {
        /// Sender
        from: Fingerprint,
        /// Decrypted payload
        payload: Bytes,
    },
    /// A group key arrived and was installed
    GroupKeyInstalled {
        /// Group
        group: GroupId,
        /// Installed epoch
        epoch: u32,
        /// Admin that sent it
        admin: Fingerprint,
    },
    /// Group data decrypted
    GroupMessage {
        /// Group
        group: GroupId,
        /// Member that encrypted it
        from: Fingerprint,
        /// Decrypted payload
        payload: Bytes,
    },
}

/// Command channel of one live connection.
struct PeerHandle {
    connection_id: u64,
    commands: mpsc::Sender<PeerCommand>,
    role: Role,
}

/// State shared by the node handle and every connection task.
pub(crate) struct Shared<S: TrustStorage, E> {
    pub(crate) store: Arc<IdentityStore<S>>,
    pub(crate) env: E,
    identity: Arc<Identity>,
    config: NodeConfig,
    groups: Mutex<GroupManager>,
    peers: Mutex<HashMap<Fingerprint, PeerHandle>>,
    events: mpsc::Sender<NodeEvent>,
    next_connection: AtomicU64,
}

impl<S, E> Shared<S, E>
where
    S: TrustStorage,
    E: Environment<Instant = Instant>,
{
    pub(crate) fn groups(&self) -> MutexGuard<'_, GroupManager> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<Fingerprint, PeerHandle>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn emit(&self, event: NodeEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }

    /// Register a new session's command channel.
    ///
    /// If the peer already has a live session, exactly one survives on both
    /// ends: the one initiated by the lower fingerprint. Returns `None` if the
    /// new session loses.
    fn register(
        &self,
        peer: Fingerprint,
        role: Role,
    ) -> Option<(u64, mpsc::Receiver<PeerCommand>)> {
        let mut peers = self.peers();

        if let Some(existing) = peers.get(&peer)
            && !existing.commands.is_closed()
        {
            let preferred = should_initiate(&self.identity.fingerprint(), &peer);
            if (role == Role::Initiator) != preferred {
                tracing::debug!(
                    "Keeping existing session with {} ({:?} wins)",
                    peer.short(),
                    existing.role
                );
                return None;
            }
            tracing::debug!("Replacing session with {}", peer.short());
        }

        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (commands, receiver) = mpsc::channel(self.config.command_buffer);
        // Dropping a replaced handle closes its channel; that task then exits
        peers.insert(peer, PeerHandle { connection_id, commands, role });
        Some((connection_id, receiver))
    }

    /// Remove a finished connection unless a newer one replaced it.
    pub(crate) fn unregister(&self, peer: &Fingerprint, connection_id: u64) {
        let mut peers = self.peers();
        if peers.get(peer).is_some_and(|handle| handle.connection_id == connection_id) {
            peers.remove(peer);
        }
    }

    /// Resend owed group keys, then prune retired epochs.
    fn maintain(&self) {
        let peers = self.peers();
        let mut courier = ChannelCourier { peers: &peers };
        let mut groups = self.groups();
        let resent = groups.redeliver(&mut courier);
        if resent > 0 {
            tracing::debug!("Resent {} group keys", resent);
        }
        groups.tick(self.env.now());
    }
}

/// Delivers group keys through the connection tasks' command channels.
///
/// Sealing happens on the receiving task, which owns the session.
struct ChannelCourier<'a> {
    peers: &'a HashMap<Fingerprint, PeerHandle>,
}

impl GroupKeyCourier for ChannelCourier<'_> {
    fn has_session(&self, peer: &Fingerprint) -> bool {
        self.peers.get(peer).is_some_and(|handle| !handle.commands.is_closed())
    }

    fn deliver(&mut self, peer: &Fingerprint, message: InnerMessage) -> Result<(), GroupError> {
        let handle = self.peers.get(peer).ok_or(GroupError::NoSession(*peer))?;
        handle.commands.try_send(PeerCommand::Seal(message)).map_err(|err| {
            tracing::warn!("Group key for {} not queued: {}", peer.short(), err);
            GroupError::NoSession(*peer)
        })
    }
}

/// Handle to a running node. Cheap to clone.
pub struct Node<S: TrustStorage, E = SystemEnv> {
    shared: Arc<Shared<S, E>>,
}

impl<S: TrustStorage, E> Clone for Node<S, E> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<S, E> Node<S, E>
where
    S: TrustStorage,
    E: Environment<Instant = Instant>,
{
    /// Create a node for the identity held in `store`.
    ///
    /// # Errors
    ///
    /// `IdentityError::NoIdentity` if the store has no local identity yet.
    pub fn new(
        store: Arc<IdentityStore<S>>,
        env: E,
        config: NodeConfig,
    ) -> Result<(Self, mpsc::Receiver<NodeEvent>), NodeError> {
        let identity = store.identity()?;
        let (events, receiver) = mpsc::channel(config.event_buffer);
        let groups = GroupManager::new(identity.fingerprint(), config.group.clone());

        tracing::info!("Node {} ready", identity.fingerprint().short());

        let shared = Shared {
            store,
            env,
            identity,
            config,
            groups: Mutex::new(groups),
            peers: Mutex::new(HashMap::new()),
            events,
            next_connection: AtomicU64::new(0),
        };
        Ok((Self { shared: Arc::new(shared) }, receiver))
    }

    /// Local fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.shared.identity.fingerprint()
    }

    /// The identity store backing this node.
    pub fn store(&self) -> &Arc<IdentityStore<S>> {
        &self.shared.store
    }

    /// Peers with a live session.
    pub fn connected_peers(&self) -> Vec<Fingerprint> {
        let mut peers: Vec<_> = self
            .shared
            .peers()
            .iter()
            .filter(|(_, handle)| !handle.commands.is_closed())
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    /// Initiate a handshake over `transport` and, once established, run the
    /// session on a background task.
    ///
    /// `expected` pins the responder's fingerprint.
    ///
    /// # Errors
    ///
    /// - `NodeError::Rejected` / `HandshakeTimeout` if the handshake fails
    /// - `NodeError::DuplicateSession` if an existing session wins the
    ///   tie-break
    /// - I/O and framing errors from the transport
    pub async fn connect<T>(
        &self,
        transport: T,
        expected: Option<Fingerprint>,
    ) -> Result<Fingerprint, NodeError>
    where
        T: Transport + 'static,
    {
        let mut handshake = Handshake::initiator(
            Arc::clone(&self.shared.identity),
            expected,
            self.shared.config.handshake.clone(),
            self.shared.env.now(),
        );
        let initial = handshake.start(&self.shared.env)?;
        self.establish(transport, handshake, initial).await
    }

    /// Respond to a handshake over `transport`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::connect`].
    pub async fn accept<T>(&self, transport: T) -> Result<Fingerprint, NodeError>
    where
        T: Transport + 'static,
    {
        let handshake = Handshake::responder(
            Arc::clone(&self.shared.identity),
            self.shared.config.handshake.clone(),
            self.shared.env.now(),
        );
        self.establish(transport, handshake, Vec::new()).await
    }

    /// Dial a TCP peer.
    ///
    /// # Errors
    ///
    /// Same as [`Self::connect`], plus connection failures.
    pub async fn dial(
        &self,
        addr: impl ToSocketAddrs,
        expected: Option<Fingerprint>,
    ) -> Result<Fingerprint, NodeError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let max_frame_len = self.shared.config.max_frame_len;
        let transport = FramedTransport::with_max_frame_len(stream, max_frame_len);
        self.connect(transport, expected).await
    }

    /// Accept TCP peers until the listener fails. Each connection gets its own
    /// task; a failed handshake only ends that connection.
    ///
    /// # Errors
    ///
    /// Returns the listener's error.
    pub async fn listen(&self, listener: TcpListener) -> Result<(), NodeError> {
        tracing::info!("Listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            tracing::debug!("Incoming connection from {}", addr);

            let node = self.clone();
            tokio::spawn(async move {
                if let Err(err) = stream.set_nodelay(true) {
                    tracing::debug!("set_nodelay failed for {}: {}", addr, err);
                }
                let transport =
                    FramedTransport::with_max_frame_len(stream, node.shared.config.max_frame_len);
                if let Err(err) = node.accept(transport).await {
                    tracing::warn!("Connection from {} failed: {}", addr, err);
                }
            });
        }
    }

    async fn establish<T>(
        &self,
        mut transport: T,
        mut handshake: Handshake<Instant>,
        initial: Vec<HandshakeAction>,
    ) -> Result<Fingerprint, NodeError>
    where
        T: Transport + 'static,
    {
        let session = match drive_handshake(&self.shared, &mut transport, &mut handshake, initial)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                handshake.abort();
                let event = NodeEvent::PeerRejected {
                    peer: handshake.peer(),
                    reason: err.reject_reason(),
                };
                self.shared.emit(event).await;
                return Err(err);
            },
        };

        self.spawn_session(transport, session, handshake.role()).await
    }

    async fn spawn_session<T>(
        &self,
        mut transport: T,
        mut session: Session,
        role: Role,
    ) -> Result<Fingerprint, NodeError>
    where
        T: Transport + 'static,
    {
        let peer = session.peer();

        let Some((connection_id, commands)) = self.shared.register(peer, role) else {
            let goodbye = session.goodbye("duplicate session")?;
            if let Err(err) = transport.send(&goodbye.to_vec()?).await {
                tracing::debug!("Goodbye to duplicate {} not sent: {}", peer.short(), err);
            }
            return Err(NodeError::DuplicateSession(peer));
        };

        tracing::info!("Peer {} connected ({:?})", peer.short(), role);
        self.shared.emit(NodeEvent::PeerConnected { peer }).await;

        tokio::spawn(run_session(
            Arc::clone(&self.shared),
            transport,
            session,
            connection_id,
            commands,
        ));
        Ok(peer)
    }

    fn commands(&self, peer: &Fingerprint) -> Result<mpsc::Sender<PeerCommand>, NodeError> {
        self.shared
            .peers()
            .get(peer)
            .map(|handle| handle.commands.clone())
            .ok_or(NodeError::NotConnected(*peer))
    }

    /// Send application data to a connected peer.
    ///
    /// # Errors
    ///
    /// `NodeError::NotConnected` if there is no live session.
    pub async fn send(
        &self,
        peer: &Fingerprint,
        payload: impl Into<Bytes>,
    ) -> Result<(), NodeError> {
        let commands = self.commands(peer)?;
        commands
            .send(PeerCommand::Seal(InnerMessage::App(payload.into())))
            .await
            .map_err(|_| NodeError::NotConnected(*peer))
    }

    /// Queue application data for every connected peer without waiting.
    ///
    /// Peers whose command queue is full miss the payload. Returns how many
    /// peers it was queued for.
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let peers = self.shared.peers();
        let mut queued = 0;
        for (peer, handle) in peers.iter() {
            let command = PeerCommand::Seal(InnerMessage::App(payload.clone()));
            match handle.commands.try_send(command) {
                Ok(()) => queued += 1,
                Err(err) => tracing::warn!("Broadcast to {} dropped: {}", peer.short(), err),
            }
        }
        queued
    }

    /// Say goodbye to a peer and close its session.
    ///
    /// # Errors
    ///
    /// `NodeError::NotConnected` if there is no live session.
    pub async fn disconnect(
        &self,
        peer: &Fingerprint,
        reason: impl Into<String>,
    ) -> Result<(), NodeError> {
        let commands = self.commands(peer)?;
        commands
            .send(PeerCommand::Close(reason.into()))
            .await
            .map_err(|_| NodeError::NotConnected(*peer))
    }

    /// Create a group with this node as admin. Every member must be
    /// connected.
    ///
    /// A member whose queue is full is still part of the group; its key is
    /// resent by [`Self::tick`].
    ///
    /// # Errors
    ///
    /// Any [`GroupError`] from creation.
    pub fn create_group(&self, members: &[Fingerprint]) -> Result<GroupId, NodeError> {
        let peers = self.shared.peers();
        let mut courier = ChannelCourier { peers: &peers };
        let mut groups = self.shared.groups();
        let epoch = groups.create_group(members, &mut courier, &self.shared.env)?;
        Ok(epoch.group_id())
    }

    /// Rotate a group to a fresh key for `members` (admin only). Members left
    /// out receive nothing and cannot read the new epoch. Keys that could not
    /// be queued are resent by [`Self::tick`].
    ///
    /// Returns the new epoch number.
    ///
    /// # Errors
    ///
    /// Any [`GroupError`] from rotation.
    pub fn rotate_group(
        &self,
        group: &GroupId,
        members: &[Fingerprint],
    ) -> Result<u32, NodeError> {
        let peers = self.shared.peers();
        let mut courier = ChannelCourier { peers: &peers };
        let mut groups = self.shared.groups();
        let now = self.shared.env.now();
        let epoch = groups.rotate(group, members, &mut courier, &self.shared.env, now)?;
        Ok(epoch.epoch())
    }

    /// Encrypt to the group's current epoch and send to every connected
    /// member.
    ///
    /// Best effort: members that are offline or whose queue is full miss the
    /// frame. Returns how many members it was queued for.
    ///
    /// # Errors
    ///
    /// `GroupError::UnknownGroup` or `CounterExhausted`.
    pub fn send_to_group(&self, group: &GroupId, payload: &[u8]) -> Result<usize, NodeError> {
        let local = self.fingerprint();
        let (message, members) = {
            let mut groups = self.shared.groups();
            let message = groups.encrypt_to_group(group, payload)?;
            let members = groups.group(group).map(|epoch| epoch.members().to_vec());
            (message, members.unwrap_or_default())
        };

        let peers = self.shared.peers();
        let mut queued = 0;
        for member in members.iter().filter(|member| **member != local) {
            let Some(handle) = peers.get(member) else {
                tracing::debug!("Group member {} offline", member.short());
                continue;
            };
            match handle.commands.try_send(PeerCommand::Forward(message.clone())) {
                Ok(()) => queued += 1,
                Err(err) => tracing::warn!("Group frame for {} dropped: {}", member.short(), err),
            }
        }
        Ok(queued)
    }

    /// Forget a group and its keys.
    pub fn leave_group(&self, group: &GroupId) -> bool {
        self.shared.groups().remove_group(group)
    }

    /// Current epoch of a group, if held.
    pub fn group_epoch(&self, group: &GroupId) -> Option<u32> {
        self.shared.groups().group(group).map(GroupEpoch::epoch)
    }

    /// Resend group keys that could not be queued earlier and prune retired
    /// epochs past their retention.
    pub fn tick(&self) {
        self.shared.maintain();
    }

    /// Run [`Self::tick`] every `tick_interval` until the node is dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let interval = self.shared.config.tick_interval;
        let env = self.shared.env.clone();

        tokio::spawn(async move {
            loop {
                env.sleep(interval).await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.maintain();
            }
        })
    }
}
