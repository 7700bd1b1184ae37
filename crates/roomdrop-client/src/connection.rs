//! Peer connection management
//!
//! Owns one peer connection per remote sid and forwards everything those
//! connections surface (state transitions, locally discovered candidates,
//! channels the remote side opens) into a single event stream consumed by
//! the session loop.

use roomdrop_core::{
    channel::ChannelOf, Channel, Connection, ConnectionState, Connector, Error, IceCandidate,
    Result, SessionDescription,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Observable output of the peer arena
#[derive(Debug)]
pub enum PeerEvent<Ch> {
    StateChanged {
        sid: String,
        state: ConnectionState,
    },
    LocalCandidate {
        sid: String,
        candidate: IceCandidate,
    },
    IncomingChannel {
        sid: String,
        channel: Ch,
    },
}

struct PeerHandle<Conn> {
    conn: Arc<Conn>,
    watchers: Vec<JoinHandle<()>>,
}

/// One peer connection per remote participant, keyed by sid
pub struct ConnectionManager<C: Connector> {
    connector: C,
    peers: HashMap<String, PeerHandle<C::Connection>>,
    events_tx: mpsc::UnboundedSender<PeerEvent<ChannelOf<C>>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, events_tx: mpsc::UnboundedSender<PeerEvent<ChannelOf<C>>>) -> Self {
        Self {
            connector,
            peers: HashMap::new(),
            events_tx,
        }
    }

    /// Track a peer, creating a fresh connection if none exists
    pub fn ensure_peer(&mut self, sid: &str) -> Result<()> {
        if self.peers.contains_key(sid) {
            return Ok(());
        }
        tracing::debug!(sid, "creating peer connection");
        let conn = Arc::new(self.connector.create(sid)?);
        let mut watchers = Vec::new();

        {
            let mut state_rx = conn.state_changes();
            let events = self.events_tx.clone();
            let sid = sid.to_string();
            watchers.push(tokio::spawn(async move {
                while state_rx.changed().await.is_ok() {
                    let state = *state_rx.borrow_and_update();
                    let _ = events.send(PeerEvent::StateChanged {
                        sid: sid.clone(),
                        state,
                    });
                    if matches!(state, ConnectionState::Closed | ConnectionState::Failed) {
                        break;
                    }
                }
            }));
        }

        if let Some(mut cand_rx) = conn.take_local_candidates() {
            let events = self.events_tx.clone();
            let sid = sid.to_string();
            watchers.push(tokio::spawn(async move {
                while let Some(candidate) = cand_rx.recv().await {
                    let _ = events.send(PeerEvent::LocalCandidate {
                        sid: sid.clone(),
                        candidate,
                    });
                }
            }));
        }

        if let Some(mut incoming_rx) = conn.take_incoming_channels() {
            let events = self.events_tx.clone();
            let sid = sid.to_string();
            watchers.push(tokio::spawn(async move {
                while let Some(channel) = incoming_rx.recv().await {
                    tracing::debug!(sid = %sid, label = channel.label(), "incoming channel");
                    let _ = events.send(PeerEvent::IncomingChannel {
                        sid: sid.clone(),
                        channel,
                    });
                }
            }));
        }

        self.peers.insert(sid.to_string(), PeerHandle { conn, watchers });
        Ok(())
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.peers.contains_key(sid)
    }

    pub fn peer_state(&self, sid: &str) -> Result<ConnectionState> {
        Ok(self.peer(sid)?.state())
    }

    pub fn sids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    fn peer(&self, sid: &str) -> Result<&Arc<C::Connection>> {
        self.peers
            .get(sid)
            .map(|p| &p.conn)
            .ok_or_else(|| Error::PeerNotFound(sid.to_string()))
    }

    /// Produce a local offer; valid only before negotiation has started
    pub async fn create_offer(&self, sid: &str) -> Result<SessionDescription> {
        let conn = self.peer(sid)?;
        if conn.state() != ConnectionState::New {
            return Err(Error::Protocol(format!(
                "offer requested while {} is {}",
                sid,
                conn.state()
            )));
        }
        conn.create_offer().await
    }

    pub async fn accept_offer(&self, sid: &str, offer: SessionDescription) -> Result<()> {
        self.peer(sid)?.accept_offer(offer).await
    }

    pub async fn create_answer(&self, sid: &str) -> Result<SessionDescription> {
        self.peer(sid)?.create_answer().await
    }

    pub async fn accept_answer(&self, sid: &str, answer: SessionDescription) -> Result<()> {
        self.peer(sid)?.accept_answer(answer).await
    }

    pub async fn add_remote_candidate(&self, sid: &str, candidate: IceCandidate) -> Result<()> {
        self.peer(sid)?.add_remote_candidate(candidate).await
    }

    /// Open a fresh channel toward `sid`; requires negotiation underway
    pub async fn open_channel(&self, sid: &str, label: &str) -> Result<ChannelOf<C>> {
        let conn = self.peer(sid)?;
        if !conn.state().is_negotiating_or_later() {
            return Err(Error::ChannelUnavailable(format!(
                "peer {} is {}",
                sid,
                conn.state()
            )));
        }
        conn.open_channel(label).await
    }

    /// Close a peer and forget it, so a later `ensure_peer` starts fresh
    ///
    /// Watchers are detached before the underlying connection is closed, so
    /// no callback fires against a connection being torn down.
    pub async fn close(&mut self, sid: &str) -> Result<()> {
        let handle = self
            .peers
            .remove(sid)
            .ok_or_else(|| Error::PeerNotFound(sid.to_string()))?;
        for watcher in &handle.watchers {
            watcher.abort();
        }
        handle.conn.close().await;
        let _ = self.events_tx.send(PeerEvent::StateChanged {
            sid: sid.to_string(),
            state: ConnectionState::Closed,
        });
        tracing::info!(sid, "peer connection closed");
        Ok(())
    }

    /// Drop tracked peers that are no longer in the room
    pub async fn prune(&mut self, members: &[String]) {
        let stale: Vec<String> = self
            .peers
            .keys()
            .filter(|sid| !members.contains(sid))
            .cloned()
            .collect();
        for sid in stale {
            tracing::debug!(sid = %sid, "pruning peer that left the room");
            let _ = self.close(&sid).await;
        }
    }

    pub async fn close_all(&mut self) {
        let sids = self.sids();
        for sid in sids {
            let _ = self.close(&sid).await;
        }
    }
}
