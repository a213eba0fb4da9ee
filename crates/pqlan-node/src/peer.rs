//! Per-peer connection task.
//!
//! Each connection runs in two phases on one task:
//!
//! 1. **Handshake**: feed received messages into the [`Handshake`] state
//!    machine until it yields a [`Session`], bounded by the handshake
//!    deadline.
//! 2. **Session**: `select!` between the peer's command channel (outbound
//!    application data, group keys, group frames) and the transport
//!    (inbound frames), until either side closes.
//!
//! The session is owned by this task alone. Other tasks reach it only through
//! [`PeerCommand`].

use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use pqlan_core::{
    Environment, FailureKind, GroupId, Handshake, HandshakeAction, Session, TrustStorage,
};
use pqlan_crypto::Fingerprint;
use pqlan_proto::{InnerMessage, Message};
use tokio::sync::mpsc;

use crate::{
    error::NodeError,
    node::{NodeEvent, Shared},
    transport::Transport,
};

/// Work handed to a connection task.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    /// Seal under the pairwise session and send
    Seal(InnerMessage),
    /// Send as is (GROUP_DATA is already encrypted)
    Forward(Message),
    /// Say goodbye and close
    Close(String),
}

/// Run the handshake to completion over `transport`.
///
/// Every receive is bounded by the handshake's remaining time. On any error
/// the caller must abort the handshake so ephemeral material is released.
pub(crate) async fn drive_handshake<T, S, E>(
    shared: &Shared<S, E>,
    transport: &mut T,
    handshake: &mut Handshake<Instant>,
    initial: Vec<HandshakeAction>,
) -> Result<Session, NodeError>
where
    T: Transport,
    S: TrustStorage,
    E: Environment<Instant = Instant>,
{
    let mut pending = initial;

    loop {
        for action in std::mem::take(&mut pending) {
            match action {
                HandshakeAction::Send(message) => transport.send(&message.to_vec()?).await?,
                HandshakeAction::Established(session) => return Ok(session),
                HandshakeAction::Rejected(reason) => return Err(NodeError::Rejected(reason)),
            }
        }

        let remaining = handshake.time_remaining(shared.env.now());
        let bytes = match tokio::time::timeout(remaining, transport.recv()).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => return Err(NodeError::ConnectionClosed),
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::warn!(
                    "Handshake ({:?}) timed out in {}",
                    handshake.role(),
                    handshake.state()
                );
                return Err(NodeError::HandshakeTimeout);
            },
        };

        let message = Message::decode(&bytes)?;
        let now = shared.env.now();
        pending = handshake.handle_message(&message, &shared.store, &shared.env, now);
    }
}

/// Session phase: runs until the peer leaves, the node drops the command
/// channel, or a fatal error.
///
/// Always unregisters the peer and wipes the session on exit.
pub(crate) async fn run_session<T, S, E>(
    shared: Arc<Shared<S, E>>,
    mut transport: T,
    mut session: Session,
    connection_id: u64,
    mut commands: mpsc::Receiver<PeerCommand>,
) where
    T: Transport,
    S: TrustStorage,
    E: Environment<Instant = Instant>,
{
    let peer = session.peer();
    let result = session_loop(&shared, &mut transport, &mut session, &mut commands).await;

    shared.unregister(&peer, connection_id);
    session.close();

    let reason = match result {
        Ok(reason) => reason,
        Err(err) => {
            tracing::warn!("Session with {} ended: {}", peer.short(), err);
            Some(err.to_string())
        },
    };
    tracing::info!("Peer {} disconnected", peer.short());
    shared.emit(NodeEvent::PeerDisconnected { peer, reason }).await;
}

/// Returns the goodbye reason, if any.
async fn session_loop<T, S, E>(
    shared: &Shared<S, E>,
    transport: &mut T,
    session: &mut Session,
    commands: &mut mpsc::Receiver<PeerCommand>,
) -> Result<Option<String>, NodeError>
where
    T: Transport,
    S: TrustStorage,
    E: Environment<Instant = Instant>,
{
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Seal(message)) => {
                    let frame = session.seal_message(&message)?;
                    transport.send(&frame.to_vec()?).await?;
                },
                Some(PeerCommand::Forward(message)) => {
                    transport.send(&message.to_vec()?).await?;
                },
                Some(PeerCommand::Close(reason)) => {
                    let frame = session.goodbye(reason.clone())?;
                    transport.send(&frame.to_vec()?).await?;
                    return Ok(Some(reason));
                },
                None => {
                    // Node dropped us, e.g. a newer session with this peer won
                    let frame = session.goodbye("superseded")?;
                    transport.send(&frame.to_vec()?).await?;
                    return Ok(None);
                },
            },
            received = transport.recv() => match received? {
                Some(bytes) => {
                    if let Some(reason) = handle_frame(shared, session, &bytes).await? {
                        return Ok(Some(reason));
                    }
                },
                None => return Ok(None),
            },
        }
    }
}

/// Process one inbound frame. Returns the peer's goodbye reason if it left.
///
/// Frame-level failures (bad tag, replay, malformed bytes) drop the frame and
/// keep the session; anything else ends it.
async fn handle_frame<S, E>(
    shared: &Shared<S, E>,
    session: &mut Session,
    bytes: &Bytes,
) -> Result<Option<String>, NodeError>
where
    S: TrustStorage,
    E: Environment<Instant = Instant>,
{
    let peer = session.peer();

    let message = match Message::decode(bytes) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!("Dropping malformed frame from {}: {}", peer.short(), err);
            return Ok(None);
        },
    };

    match message {
        Message::Data(frame) => match session.open(&frame) {
            Ok(inner) => handle_inner(shared, peer, inner).await,
            Err(err)
                if matches!(
                    err.kind(),
                    FailureKind::CryptoFailure | FailureKind::ReplayDetected | FailureKind::Protocol
                ) =>
            {
                Ok(None)
            },
            Err(err) => Err(err.into()),
        },
        Message::GroupData(frame) => {
            let result = shared.groups().decrypt_from_group(&frame);
            if let Ok(plaintext) = result {
                shared
                    .emit(NodeEvent::GroupMessage {
                        group: GroupId::from_bytes(frame.group_id),
                        from: frame.sender,
                        payload: Bytes::from(plaintext),
                    })
                    .await;
            }
            Ok(None)
        },
        Message::Offer(_) | Message::Response(_) => {
            tracing::warn!("Dropping handshake message from {} on open session", peer.short());
            Ok(None)
        },
    }
}

async fn handle_inner<S, E>(
    shared: &Shared<S, E>,
    peer: Fingerprint,
    inner: InnerMessage,
) -> Result<Option<String>, NodeError>
where
    S: TrustStorage,
    E: Environment<Instant = Instant>,
{
    match inner {
        InnerMessage::App(payload) => {
            shared.emit(NodeEvent::Message { from: peer, payload }).await;
        },
        InnerMessage::GroupKey(group_key) => {
            let installed = shared
                .groups()
                .install_group_key(&peer, group_key, shared.env.now())
                .map(|epoch| (epoch.group_id(), epoch.epoch()));

            match installed {
                Ok((group, epoch)) => {
                    shared.emit(NodeEvent::GroupKeyInstalled { group, epoch, admin: peer }).await;
                },
                Err(err) => {
                    tracing::warn!("Rejected group key from {}: {}", peer.short(), err);
                },
            }
        },
        InnerMessage::Goodbye { reason } => {
            tracing::debug!("Peer {} said goodbye: {}", peer.short(), reason);
            return Ok(Some(reason));
        },
        InnerMessage::Ready => {
            tracing::debug!("Ignoring duplicate READY from {}", peer.short());
        },
    }
    Ok(None)
}
