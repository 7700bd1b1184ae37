//! Signaling bus events and capability
//!
//! The bus relays opaque negotiation messages and room membership between
//! peers; it never carries file bytes. The `mem` submodule provides an
//! in-process hub with the same room semantics as a production relay.

use crate::channel::{IceCandidate, SessionDescription};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Payload of a `room_clients` broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomClientsPayload {
    pub clients: Vec<String>,
}

/// Payload of a relayed `offer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub offer: SessionDescription,
    pub room: String,
    pub to: String,
    pub from: String,
}

/// Payload of a relayed `answer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub answer: SessionDescription,
    pub room: String,
    pub to: String,
    pub from: String,
}

/// Payload of a relayed `ice_candidate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    pub room: String,
    pub to: String,
    pub from: String,
}

/// Payload of a `join_room_error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoomErrorPayload {
    pub message: String,
}

/// Every event the bus can deliver to or accept from a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SignalEvent {
    RoomClients(RoomClientsPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(CandidatePayload),
    JoinRoomError(JoinRoomErrorPayload),
}

impl SignalEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalEvent::RoomClients(_) => "room_clients",
            SignalEvent::Offer(_) => "offer",
            SignalEvent::Answer(_) => "answer",
            SignalEvent::IceCandidate(_) => "ice_candidate",
            SignalEvent::JoinRoomError(_) => "join_room_error",
        }
    }

    /// Target sid of a directed event, if any
    pub fn to(&self) -> Option<&str> {
        match self {
            SignalEvent::Offer(p) => Some(&p.to),
            SignalEvent::Answer(p) => Some(&p.to),
            SignalEvent::IceCandidate(p) => Some(&p.to),
            _ => None,
        }
    }

    /// Sender sid of a directed event, if any
    pub fn from(&self) -> Option<&str> {
        match self {
            SignalEvent::Offer(p) => Some(&p.from),
            SignalEvent::Answer(p) => Some(&p.from),
            SignalEvent::IceCandidate(p) => Some(&p.from),
            _ => None,
        }
    }
}

/// Capability contract toward the signaling bus
#[allow(async_fn_in_trait)]
pub trait SignalingBus: Send + Sync + 'static {
    /// This peer's id on the bus
    fn local_sid(&self) -> &str;

    async fn join_room(&self, room: &str) -> Result<()>;

    async fn leave_room(&self, room: &str) -> Result<()>;

    /// Publish a directed event for the bus to relay
    async fn publish(&self, event: SignalEvent) -> Result<()>;

    /// Next event from the bus; `None` once disconnected
    async fn next_event(&self) -> Result<Option<SignalEvent>>;

    /// Drop off the bus, leaving every joined room
    async fn disconnect(&self);
}

pub mod mem {
    //! In-process signaling hub for tests and the loopback demo

    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    const MAX_ROOMS: usize = 1024;
    const MAX_CLIENTS_PER_ROOM: usize = 8;

    /// Hub relaying events between registered clients
    pub struct MemHub {
        inner: Mutex<HubInner>,
    }

    struct HubInner {
        clients: HashMap<String, mpsc::UnboundedSender<SignalEvent>>,
        rooms: HashMap<String, BTreeSet<String>>,
    }

    impl MemHub {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(HubInner {
                    clients: HashMap::new(),
                    rooms: HashMap::new(),
                }),
            })
        }

        /// Register a client and hand back its bus handle
        pub fn client(self: &Arc<Self>, sid: &str) -> MemBusClient {
            let (tx, rx) = mpsc::unbounded_channel();
            self.inner
                .lock()
                .unwrap()
                .clients
                .insert(sid.to_string(), tx);
            MemBusClient {
                hub: self.clone(),
                sid: sid.to_string(),
                rx: tokio::sync::Mutex::new(rx),
            }
        }

        fn send_to(inner: &HubInner, sid: &str, event: SignalEvent) {
            if let Some(tx) = inner.clients.get(sid) {
                let _ = tx.send(event);
            } else {
                tracing::warn!(sid, "dropping signaling event for unknown client");
            }
        }

        fn broadcast_room_clients(inner: &HubInner, room: &str) {
            let Some(members) = inner.rooms.get(room) else {
                return;
            };
            let clients: Vec<String> = members.iter().cloned().collect();
            for sid in members {
                Self::send_to(
                    inner,
                    sid,
                    SignalEvent::RoomClients(RoomClientsPayload {
                        clients: clients.clone(),
                    }),
                );
            }
        }

        fn join_room(&self, sid: &str, room: &str) {
            let mut inner = self.inner.lock().unwrap();
            if room.is_empty() {
                Self::send_to(
                    &inner,
                    sid,
                    SignalEvent::JoinRoomError(JoinRoomErrorPayload {
                        message: "Invalid room id".to_string(),
                    }),
                );
                return;
            }
            if !inner.rooms.contains_key(room) && inner.rooms.len() >= MAX_ROOMS {
                Self::send_to(
                    &inner,
                    sid,
                    SignalEvent::JoinRoomError(JoinRoomErrorPayload {
                        message: "Rooms limit exceeded".to_string(),
                    }),
                );
                return;
            }
            let full = inner
                .rooms
                .get(room)
                .map(|members| !members.contains(sid) && members.len() >= MAX_CLIENTS_PER_ROOM)
                .unwrap_or(false);
            if full {
                Self::send_to(
                    &inner,
                    sid,
                    SignalEvent::JoinRoomError(JoinRoomErrorPayload {
                        message: "Clients limit exceeded".to_string(),
                    }),
                );
                return;
            }
            inner
                .rooms
                .entry(room.to_string())
                .or_default()
                .insert(sid.to_string());
            Self::broadcast_room_clients(&inner, room);
        }

        fn leave_room(&self, sid: &str, room: &str) {
            let mut inner = self.inner.lock().unwrap();
            let emptied = match inner.rooms.get_mut(room) {
                Some(members) => {
                    members.remove(sid);
                    members.is_empty()
                }
                None => return,
            };
            if emptied {
                inner.rooms.remove(room);
            } else {
                Self::broadcast_room_clients(&inner, room);
            }
        }

        fn disconnect(&self, sid: &str) {
            let mut inner = self.inner.lock().unwrap();
            inner.clients.remove(sid);
            let mut touched = Vec::new();
            inner.rooms.retain(|room, members| {
                if members.remove(sid) && !members.is_empty() {
                    touched.push(room.clone());
                }
                !members.is_empty()
            });
            for room in touched {
                Self::broadcast_room_clients(&inner, &room);
            }
        }

        /// Relay a directed event to its `to` sid
        fn route(&self, from: &str, event: SignalEvent) {
            let inner = self.inner.lock().unwrap();
            match event.to().map(str::to_string) {
                Some(to) => {
                    tracing::debug!(event = event.event_name(), from, to = %to, "relaying");
                    Self::send_to(&inner, &to, event);
                }
                None => {
                    tracing::warn!(
                        event = event.event_name(),
                        from,
                        "dropping undirected event"
                    );
                }
            }
        }
    }

    /// One peer's handle on the hub
    pub struct MemBusClient {
        hub: Arc<MemHub>,
        sid: String,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalEvent>>,
    }

    impl SignalingBus for MemBusClient {
        fn local_sid(&self) -> &str {
            &self.sid
        }

        async fn join_room(&self, room: &str) -> Result<()> {
            self.hub.join_room(&self.sid, room);
            Ok(())
        }

        async fn leave_room(&self, room: &str) -> Result<()> {
            self.hub.leave_room(&self.sid, room);
            Ok(())
        }

        async fn publish(&self, event: SignalEvent) -> Result<()> {
            self.hub.route(&self.sid, event);
            Ok(())
        }

        async fn next_event(&self) -> Result<Option<SignalEvent>> {
            Ok(self.rx.lock().await.recv().await)
        }

        async fn disconnect(&self) {
            self.hub.disconnect(&self.sid);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::channel::{SdpKind, SessionDescription};

        #[tokio::test]
        async fn test_join_broadcasts_membership() {
            let hub = MemHub::new();
            let alice = hub.client("alice");
            let bob = hub.client("bob");

            alice.join_room("room-1").await.unwrap();
            let ev = alice.next_event().await.unwrap().unwrap();
            assert_eq!(
                ev,
                SignalEvent::RoomClients(RoomClientsPayload {
                    clients: vec!["alice".into()],
                })
            );

            bob.join_room("room-1").await.unwrap();
            let ev = bob.next_event().await.unwrap().unwrap();
            assert_eq!(
                ev,
                SignalEvent::RoomClients(RoomClientsPayload {
                    clients: vec!["alice".into(), "bob".into()],
                })
            );
            // The existing member sees the updated roster too
            let ev = alice.next_event().await.unwrap().unwrap();
            assert_eq!(
                ev,
                SignalEvent::RoomClients(RoomClientsPayload {
                    clients: vec!["alice".into(), "bob".into()],
                })
            );
        }

        #[tokio::test]
        async fn test_leave_broadcasts_membership() {
            let hub = MemHub::new();
            let alice = hub.client("alice");
            let bob = hub.client("bob");
            alice.join_room("room-1").await.unwrap();
            bob.join_room("room-1").await.unwrap();

            bob.leave_room("room-1").await.unwrap();
            // Skip the two join broadcasts
            alice.next_event().await.unwrap();
            alice.next_event().await.unwrap();
            let ev = alice.next_event().await.unwrap().unwrap();
            assert_eq!(
                ev,
                SignalEvent::RoomClients(RoomClientsPayload {
                    clients: vec!["alice".into()],
                })
            );
        }

        #[tokio::test]
        async fn test_room_client_limit() {
            let hub = MemHub::new();
            let mut clients = Vec::new();
            for i in 0..MAX_CLIENTS_PER_ROOM {
                let c = hub.client(&format!("peer-{}", i));
                c.join_room("crowded").await.unwrap();
                clients.push(c);
            }
            let straggler = hub.client("straggler");
            straggler.join_room("crowded").await.unwrap();
            let ev = straggler.next_event().await.unwrap().unwrap();
            assert_eq!(
                ev,
                SignalEvent::JoinRoomError(JoinRoomErrorPayload {
                    message: "Clients limit exceeded".into(),
                })
            );
        }

        #[tokio::test]
        async fn test_directed_relay() {
            let hub = MemHub::new();
            let alice = hub.client("alice");
            let bob = hub.client("bob");
            alice.join_room("room-1").await.unwrap();
            bob.join_room("room-1").await.unwrap();

            let offer = SignalEvent::Offer(OfferPayload {
                offer: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                },
                room: "room-1".into(),
                to: "bob".into(),
                from: "alice".into(),
            });
            alice.publish(offer.clone()).await.unwrap();

            // Bob sees his own join broadcast, then the offer
            bob.next_event().await.unwrap();
            let ev = bob.next_event().await.unwrap().unwrap();
            assert_eq!(ev, offer);
        }

        #[test]
        fn test_event_wire_shape() {
            let ev = SignalEvent::IceCandidate(CandidatePayload {
                candidate: IceCandidate {
                    candidate: "candidate:1".into(),
                    sdp_mid: None,
                },
                room: "r".into(),
                to: "b".into(),
                from: "a".into(),
            });
            let json = serde_json::to_value(&ev).unwrap();
            assert_eq!(json["event"], "ice_candidate");
            assert_eq!(json["data"]["to"], "b");
            assert_eq!(json["data"]["from"], "a");
            assert_eq!(json["data"]["candidate"]["candidate"], "candidate:1");
        }
    }
}
