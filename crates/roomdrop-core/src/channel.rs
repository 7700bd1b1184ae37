//! Direct peer channel capabilities
//!
//! This module abstracts the platform peer-connection transport behind
//! explicit capability traits: a `Connection` drives offer/answer/candidate
//! negotiation and hands out labeled `Channel`s; a `Connector` mints
//! connections toward remote peers. The `mem` submodule provides an
//! in-process implementation used by tests and the loopback demo.

use crate::error::{Error, Result};
use crate::frame::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, watch};

/// Connection lifecycle per remote peer
///
/// `Connected` is reachable only after both session descriptions have been
/// exchanged and at least one remote network-path candidate has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// True once negotiation has at least begun
    pub fn is_negotiating_or_later(&self) -> bool {
        !matches!(self, ConnectionState::New)
            && !matches!(
                self,
                ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
            )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Which half of the offer/answer exchange a description is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A local or remote session description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// A discovered network-path candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// A labeled, ordered, reliable duplex message pipe between two peers
#[allow(async_fn_in_trait)]
pub trait Channel: Send + Sync + 'static {
    /// The channel label (a transfer id)
    fn label(&self) -> &str;

    /// False once either side has closed the channel
    fn is_open(&self) -> bool;

    /// Bytes queued locally but not yet handed to the remote peer
    fn buffered_amount(&self) -> usize;

    /// Queue a message for delivery
    async fn send(&self, msg: Message) -> Result<()>;

    /// Receive the next message; `None` once the channel is closed and drained
    async fn recv(&self) -> Result<Option<Message>>;

    /// Wait until the buffered amount has drained to the low-water mark
    /// (or the channel closed)
    async fn buffered_low(&self) -> Result<()>;

    /// Wait until no bytes remain buffered (or the channel closed)
    async fn drained(&self) -> Result<()>;

    /// Close both directions
    async fn close(&self);
}

/// One peer connection: negotiation plus channel creation
#[allow(async_fn_in_trait)]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    fn state(&self) -> ConnectionState;

    /// Subscribe to connection-state transitions
    fn state_changes(&self) -> watch::Receiver<ConnectionState>;

    /// Hand off the stream of locally discovered candidates (once)
    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>>;

    /// Hand off the stream of channels the remote peer creates (once)
    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Self::Channel>>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn accept_offer(&self, offer: SessionDescription) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Create a fresh channel labeled `label`
    async fn open_channel(&self, label: &str) -> Result<Self::Channel>;

    /// Close every channel and the connection itself
    async fn close(&self);
}

/// Mints peer connections toward remote sids
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn create(&self, remote_sid: &str) -> Result<Self::Connection>;
}

/// Channel type produced by a connector
pub type ChannelOf<C> = <<C as Connector>::Connection as Connection>::Channel;

pub mod mem {
    //! In-process transport for tests and the loopback demo
    //!
    //! Connections created from the same `MemNetwork` are linked by
    //! `(local, remote)` sid pairs; channels opened on one side surface on
    //! the other side's incoming stream, with real byte accounting and
    //! buffer-low signaling on every pipe.

    use super::*;
    use crate::BUFFER_LOW_WATER;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// Registry linking connection endpoints by sid pair
    pub struct MemNetwork {
        inner: Mutex<NetworkInner>,
    }

    struct NetworkInner {
        /// Incoming-channel mailboxes keyed by (local, remote)
        endpoints: HashMap<(String, String), mpsc::UnboundedSender<MemChannel>>,
        /// Channels delivered before the far side registered
        pending: HashMap<(String, String), Vec<MemChannel>>,
    }

    impl MemNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(NetworkInner {
                    endpoints: HashMap::new(),
                    pending: HashMap::new(),
                }),
            })
        }

        /// Build a connector for a local sid on this network
        pub fn connector(self: &Arc<Self>, local_sid: &str) -> MemConnector {
            MemConnector {
                network: self.clone(),
                local_sid: local_sid.to_string(),
                low_water: BUFFER_LOW_WATER,
            }
        }

        fn register(
            &self,
            local: &str,
            remote: &str,
        ) -> mpsc::UnboundedReceiver<MemChannel> {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut inner = self.inner.lock().unwrap();
            let key = (local.to_string(), remote.to_string());
            if let Some(queued) = inner.pending.remove(&key) {
                for ch in queued {
                    let _ = tx.send(ch);
                }
            }
            inner.endpoints.insert(key, tx);
            rx
        }

        fn unregister(&self, local: &str, remote: &str) {
            let mut inner = self.inner.lock().unwrap();
            inner
                .endpoints
                .remove(&(local.to_string(), remote.to_string()));
        }

        fn deliver(&self, from: &str, to: &str, channel: MemChannel) {
            let mut inner = self.inner.lock().unwrap();
            let key = (to.to_string(), from.to_string());
            match inner.endpoints.get(&key) {
                Some(tx) if tx.send(channel.clone()).is_ok() => {}
                _ => inner.pending.entry(key).or_default().push(channel),
            }
        }
    }

    /// Connector bound to one local sid
    pub struct MemConnector {
        network: Arc<MemNetwork>,
        local_sid: String,
        low_water: usize,
    }

    impl MemConnector {
        pub fn with_low_water(mut self, low_water: usize) -> Self {
            self.low_water = low_water;
            self
        }

        pub fn local_sid(&self) -> &str {
            &self.local_sid
        }
    }

    impl Connector for MemConnector {
        type Connection = MemConnection;

        fn create(&self, remote_sid: &str) -> Result<MemConnection> {
            Ok(MemConnection::new(
                &self.network,
                &self.local_sid,
                remote_sid,
                self.low_water,
            ))
        }
    }

    struct Negotiation {
        local_desc: Option<SessionDescription>,
        remote_desc: Option<SessionDescription>,
        remote_candidates: u32,
    }

    /// One side of an in-process peer connection
    pub struct MemConnection {
        local: String,
        remote: String,
        network: Arc<MemNetwork>,
        low_water: usize,
        state_tx: watch::Sender<ConnectionState>,
        negotiation: Mutex<Negotiation>,
        cand_tx: mpsc::UnboundedSender<IceCandidate>,
        cand_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
        incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<MemChannel>>>,
        channels: Mutex<Vec<MemChannel>>,
    }

    impl MemConnection {
        fn new(network: &Arc<MemNetwork>, local: &str, remote: &str, low_water: usize) -> Self {
            let incoming_rx = network.register(local, remote);
            let (cand_tx, cand_rx) = mpsc::unbounded_channel();
            let (state_tx, _) = watch::channel(ConnectionState::New);
            Self {
                local: local.to_string(),
                remote: remote.to_string(),
                network: network.clone(),
                low_water,
                state_tx,
                negotiation: Mutex::new(Negotiation {
                    local_desc: None,
                    remote_desc: None,
                    remote_candidates: 0,
                }),
                cand_tx,
                cand_rx: Mutex::new(Some(cand_rx)),
                incoming_rx: Mutex::new(Some(incoming_rx)),
                channels: Mutex::new(Vec::new()),
            }
        }

        fn set_state(&self, state: ConnectionState) {
            self.state_tx.send_replace(state);
        }

        fn description(&self, kind: SdpKind) -> SessionDescription {
            SessionDescription {
                kind,
                sdp: format!("v=0 mem {} -> {}", self.local, self.remote),
            }
        }

        /// Path discovery starts once a local description is in place
        fn gather_candidate(&self) {
            let _ = self.cand_tx.send(IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 mem://{} typ host", self.local),
                sdp_mid: Some("0".to_string()),
            });
        }

        fn maybe_connected(&self) {
            let negotiation = self.negotiation.lock().unwrap();
            if negotiation.local_desc.is_some()
                && negotiation.remote_desc.is_some()
                && negotiation.remote_candidates > 0
                && *self.state_tx.borrow() == ConnectionState::Negotiating
            {
                drop(negotiation);
                self.set_state(ConnectionState::Connected);
            }
        }
    }

    impl Connection for MemConnection {
        type Channel = MemChannel;

        fn state(&self) -> ConnectionState {
            *self.state_tx.borrow()
        }

        fn state_changes(&self) -> watch::Receiver<ConnectionState> {
            self.state_tx.subscribe()
        }

        fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
            self.cand_rx.lock().unwrap().take()
        }

        fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<MemChannel>> {
            self.incoming_rx.lock().unwrap().take()
        }

        async fn create_offer(&self) -> Result<SessionDescription> {
            {
                let mut negotiation = self.negotiation.lock().unwrap();
                if negotiation.local_desc.is_some() {
                    return Err(Error::Protocol(format!(
                        "local description already set for {}",
                        self.remote
                    )));
                }
                let offer = self.description(SdpKind::Offer);
                negotiation.local_desc = Some(offer);
            }
            self.set_state(ConnectionState::Negotiating);
            self.gather_candidate();
            Ok(self.description(SdpKind::Offer))
        }

        async fn accept_offer(&self, offer: SessionDescription) -> Result<()> {
            {
                let mut negotiation = self.negotiation.lock().unwrap();
                negotiation.remote_desc = Some(offer);
            }
            if *self.state_tx.borrow() == ConnectionState::New {
                self.set_state(ConnectionState::Negotiating);
            }
            self.maybe_connected();
            Ok(())
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            {
                let mut negotiation = self.negotiation.lock().unwrap();
                if negotiation.remote_desc.is_none() {
                    return Err(Error::Protocol(format!(
                        "no remote offer from {}",
                        self.remote
                    )));
                }
                let answer = self.description(SdpKind::Answer);
                negotiation.local_desc = Some(answer);
            }
            self.gather_candidate();
            self.maybe_connected();
            Ok(self.description(SdpKind::Answer))
        }

        async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
            {
                let mut negotiation = self.negotiation.lock().unwrap();
                negotiation.remote_desc = Some(answer);
            }
            self.maybe_connected();
            Ok(())
        }

        async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            if *self.state_tx.borrow() == ConnectionState::Connected {
                // Redundant once a path is established
                return Ok(());
            }
            {
                let mut negotiation = self.negotiation.lock().unwrap();
                negotiation.remote_candidates += 1;
            }
            self.maybe_connected();
            Ok(())
        }

        async fn open_channel(&self, label: &str) -> Result<MemChannel> {
            let state = *self.state_tx.borrow();
            if matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
            ) {
                return Err(Error::ChannelUnavailable(format!(
                    "connection to {} is {}",
                    self.remote, state
                )));
            }
            let (near, far) = MemChannel::pair(label, self.low_water);
            self.channels.lock().unwrap().push(near.clone());
            self.network.deliver(&self.local, &self.remote, far);
            Ok(near)
        }

        async fn close(&self) {
            self.set_state(ConnectionState::Closed);
            let channels: Vec<MemChannel> = self.channels.lock().unwrap().drain(..).collect();
            for channel in channels {
                channel.close_pipes();
            }
            self.network.unregister(&self.local, &self.remote);
        }
    }

    struct PipeState {
        queue: VecDeque<Message>,
        buffered: usize,
        closed: bool,
    }

    struct Pipe {
        state: Mutex<PipeState>,
        readable: Notify,
        drained: Notify,
    }

    impl Pipe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(PipeState {
                    queue: VecDeque::new(),
                    buffered: 0,
                    closed: false,
                }),
                readable: Notify::new(),
                drained: Notify::new(),
            })
        }

        fn close(&self) {
            self.state.lock().unwrap().closed = true;
            self.readable.notify_one();
            self.drained.notify_one();
        }
    }

    /// One endpoint of an in-process channel pair
    #[derive(Clone)]
    pub struct MemChannel {
        label: Arc<str>,
        out: Arc<Pipe>,
        inc: Arc<Pipe>,
        low_water: usize,
    }

    impl MemChannel {
        /// Create two linked endpoints
        pub fn pair(label: &str, low_water: usize) -> (MemChannel, MemChannel) {
            let a = Pipe::new();
            let b = Pipe::new();
            let near = MemChannel {
                label: Arc::from(label),
                out: a.clone(),
                inc: b.clone(),
                low_water,
            };
            let far = MemChannel {
                label: Arc::from(label),
                out: b,
                inc: a,
                low_water,
            };
            (near, far)
        }

        fn close_pipes(&self) {
            self.out.close();
            self.inc.close();
        }
    }

    impl Channel for MemChannel {
        fn label(&self) -> &str {
            &self.label
        }

        fn is_open(&self) -> bool {
            !self.out.state.lock().unwrap().closed
        }

        fn buffered_amount(&self) -> usize {
            self.out.state.lock().unwrap().buffered
        }

        async fn send(&self, msg: Message) -> Result<()> {
            {
                let mut state = self.out.state.lock().unwrap();
                if state.closed {
                    return Err(Error::ChannelUnavailable(format!(
                        "channel {} is closed",
                        self.label
                    )));
                }
                state.buffered += msg.len();
                state.queue.push_back(msg);
            }
            self.out.readable.notify_one();
            Ok(())
        }

        async fn recv(&self) -> Result<Option<Message>> {
            loop {
                let readable = self.inc.readable.notified();
                {
                    let mut state = self.inc.state.lock().unwrap();
                    if let Some(msg) = state.queue.pop_front() {
                        state.buffered -= msg.len();
                        self.inc.drained.notify_one();
                        return Ok(Some(msg));
                    }
                    if state.closed {
                        return Ok(None);
                    }
                }
                readable.await;
            }
        }

        async fn buffered_low(&self) -> Result<()> {
            loop {
                let drained = self.out.drained.notified();
                {
                    let state = self.out.state.lock().unwrap();
                    if state.buffered <= self.low_water || state.closed {
                        return Ok(());
                    }
                }
                drained.await;
            }
        }

        async fn drained(&self) -> Result<()> {
            loop {
                let drained = self.out.drained.notified();
                {
                    let state = self.out.state.lock().unwrap();
                    if state.buffered == 0 || state.closed {
                        return Ok(());
                    }
                }
                drained.await;
            }
        }

        async fn close(&self) {
            self.close_pipes();
        }
    }

}
