//! Process-wide session
//!
//! A `Session` owns the signaling bus handle, the peer connection arena, and
//! the shared chunk store, and runs one cooperative event loop multiplexing
//! bus events, peer events, and external commands. Each in-flight transfer
//! runs as its own task, so transfers on different peer connections make
//! independent progress.

use crate::connection::{ConnectionManager, PeerEvent};
use crate::coordinator::SignalingCoordinator;
use crate::store::{storage_err, ChunkStore};
use crate::transfer::{self, FlowControl, TransferEvent};
use roomdrop_core::{
    channel::ChannelOf, Channel, ConnectionState, Connector, Error, Result, SignalEvent,
    SignalingBus, TransferMetadata,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// External control of a running session
#[derive(Debug)]
pub enum SessionCommand {
    /// Start negotiation toward a room member
    Dial { sid: String },
    /// Send a file to a connected peer
    SendFile { sid: String, path: PathBuf },
    /// Close a peer connection
    ClosePeer { sid: String },
    /// Leave the room and stop
    Shutdown,
}

/// Observable session state changes
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RoomClients(Vec<String>),
    ConnectionState {
        sid: String,
        state: ConnectionState,
    },
    Transfer(TransferEvent),
    TransferFailed {
        sid: String,
        reason: String,
    },
    JoinError(String),
}

/// Command/event handle held by the caller of a running session
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionHandle {
    pub fn dial(&self, sid: &str) {
        let _ = self.commands.send(SessionCommand::Dial {
            sid: sid.to_string(),
        });
    }

    pub fn send_file(&self, sid: &str, path: impl Into<PathBuf>) {
        let _ = self.commands.send(SessionCommand::SendFile {
            sid: sid.to_string(),
            path: path.into(),
        });
    }

    pub fn close_peer(&self, sid: &str) {
        let _ = self.commands.send(SessionCommand::ClosePeer {
            sid: sid.to_string(),
        });
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

/// One peer's view of a room, from join to shutdown
pub struct Session<C: Connector, B: SignalingBus> {
    bus: B,
    manager: ConnectionManager<C>,
    coordinator: SignalingCoordinator,
    store: Arc<Mutex<ChunkStore>>,
    chunk_size: u32,
    flow: FlowControl,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    peer_events_rx: mpsc::UnboundedReceiver<PeerEvent<ChannelOf<C>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl<C: Connector, B: SignalingBus> Session<C, B> {
    pub fn new(
        bus: B,
        connector: C,
        store: Arc<Mutex<ChunkStore>>,
        room: &str,
        chunk_size: u32,
        flow: FlowControl,
    ) -> (Self, SessionHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let coordinator = SignalingCoordinator::new(room, bus.local_sid());
        let manager = ConnectionManager::new(connector, peer_events_tx);

        (
            Self {
                bus,
                manager,
                coordinator,
                store,
                chunk_size,
                flow,
                commands_rx,
                peer_events_rx,
                events_tx,
            },
            SessionHandle {
                commands: commands_tx,
                events: events_rx,
            },
        )
    }

    /// Join the room and process events until shutdown
    pub async fn run(self) {
        let Session {
            bus,
            mut manager,
            mut coordinator,
            store,
            chunk_size,
            flow,
            mut commands_rx,
            mut peer_events_rx,
            events_tx,
        } = self;

        tracing::info!(sid = bus.local_sid(), room = coordinator.room(), "joining room");
        if let Err(e) = bus.join_room(coordinator.room()).await {
            tracing::error!(error = %e, "could not join room");
            let _ = events_tx.send(SessionEvent::JoinError(e.to_string()));
            return;
        }

        loop {
            tokio::select! {
                cmd = commands_rx.recv() => {
                    match cmd {
                        None | Some(SessionCommand::Shutdown) => break,
                        Some(SessionCommand::Dial { sid }) => {
                            if let Err(e) = coordinator.dial(&sid, &mut manager, &bus).await {
                                tracing::warn!(sid = %sid, error = %e, "dial failed");
                            }
                        }
                        Some(SessionCommand::SendFile { sid, path }) => {
                            match open_send(&manager, &store, chunk_size, &sid, &path).await {
                                Ok((channel, meta)) => {
                                    spawn_send(channel, store.clone(), meta, path, flow, sid, events_tx.clone());
                                }
                                Err(e) => {
                                    tracing::warn!(sid = %sid, error = %e, "send rejected");
                                    let _ = events_tx.send(SessionEvent::TransferFailed {
                                        sid,
                                        reason: e.to_string(),
                                    });
                                }
                            }
                        }
                        Some(SessionCommand::ClosePeer { sid }) => {
                            if let Err(e) = manager.close(&sid).await {
                                tracing::warn!(sid = %sid, error = %e, "close failed");
                            }
                        }
                    }
                }
                event = bus.next_event() => {
                    match event {
                        Ok(Some(event)) => {
                            if let SignalEvent::JoinRoomError(payload) = &event {
                                let _ = events_tx.send(SessionEvent::JoinError(payload.message.clone()));
                            }
                            match coordinator.handle_event(event, &mut manager, &bus).await {
                                Ok(Some(clients)) => {
                                    let _ = events_tx.send(SessionEvent::RoomClients(clients));
                                }
                                Ok(None) => {}
                                Err(e) => tracing::warn!(error = %e, "signaling event failed"),
                            }
                        }
                        Ok(None) => {
                            tracing::info!("signaling bus disconnected");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "signaling bus error");
                            break;
                        }
                    }
                }
                peer_event = peer_events_rx.recv() => {
                    let Some(peer_event) = peer_event else { continue };
                    match peer_event {
                        PeerEvent::StateChanged { sid, state } => {
                            tracing::debug!(sid = %sid, state = %state, "connection state");
                            let _ = events_tx.send(SessionEvent::ConnectionState { sid, state });
                        }
                        PeerEvent::LocalCandidate { sid, candidate } => {
                            if let Err(e) = coordinator
                                .publish_local_candidate(&sid, candidate, &bus)
                                .await
                            {
                                tracing::warn!(sid = %sid, error = %e, "candidate publish failed");
                            }
                        }
                        PeerEvent::IncomingChannel { sid, channel } => {
                            spawn_receive(channel, sid, store.clone(), events_tx.clone());
                        }
                    }
                }
            }
        }

        // Tear down: release every peer connection, then drop off the bus
        manager.close_all().await;
        let _ = bus.leave_room(coordinator.room()).await;
        bus.disconnect().await;
        tracing::info!(sid = bus.local_sid(), "session shut down");
    }
}

/// Validate the send precondition and set up the channel
///
/// The peer must be `connected`; the pending metadata row is persisted
/// before the channel is opened.
async fn open_send<C: Connector>(
    manager: &ConnectionManager<C>,
    store: &Arc<Mutex<ChunkStore>>,
    chunk_size: u32,
    sid: &str,
    path: &std::path::Path,
) -> Result<(ChannelOf<C>, TransferMetadata)> {
    let state = manager.peer_state(sid)?;
    if state != ConnectionState::Connected {
        return Err(Error::ChannelUnavailable(format!(
            "peer {} is {}, not connected",
            sid, state
        )));
    }
    let meta = TransferMetadata::for_file(path, sid, chunk_size)?;
    store
        .lock()
        .await
        .save_metadata(&meta)
        .map_err(storage_err)?;
    let channel = manager.open_channel(sid, &meta.id).await?;
    Ok((channel, meta))
}

fn spawn_send<Ch: Channel>(
    channel: Ch,
    store: Arc<Mutex<ChunkStore>>,
    meta: TransferMetadata,
    path: PathBuf,
    flow: FlowControl,
    sid: String,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let progress_tx = events_tx.clone();
    tokio::spawn(async move {
        let on_progress = move |ev: TransferEvent| {
            let _ = progress_tx.send(SessionEvent::Transfer(ev));
        };
        if let Err(e) = transfer::send_file(channel, store, meta, path, flow, on_progress).await {
            tracing::warn!(sid = %sid, error = %e, "send failed");
            let _ = events_tx.send(SessionEvent::TransferFailed {
                sid,
                reason: e.to_string(),
            });
        }
    });
}

fn spawn_receive<Ch: Channel>(
    channel: Ch,
    sid: String,
    store: Arc<Mutex<ChunkStore>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let progress_tx = events_tx.clone();
    tokio::spawn(async move {
        let on_progress = move |ev: TransferEvent| {
            let _ = progress_tx.send(SessionEvent::Transfer(ev));
        };
        if let Err(e) = transfer::receive_file(channel, &sid, store, on_progress).await {
            tracing::warn!(sid = %sid, error = %e, "receive failed");
            let _ = events_tx.send(SessionEvent::TransferFailed {
                sid,
                reason: e.to_string(),
            });
        }
    });
}
