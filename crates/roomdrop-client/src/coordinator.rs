//! Signaling coordination
//!
//! Translates bus events into connection-manager calls keyed by the sender
//! sid, and negotiation outputs into outbound publishes keyed by
//! `(room, to, from)`. Signaling that references a peer outside the current
//! room-membership snapshot is logged and dropped.

use crate::connection::ConnectionManager;
use roomdrop_core::{
    signal::{AnswerPayload, CandidatePayload, OfferPayload},
    Connector, IceCandidate, Result, SignalEvent, SignalingBus,
};

/// Stateless translator between the bus and the connection manager
///
/// The only state carried is the latest room-membership snapshot, used to
/// filter signaling from peers that are not in the room.
pub struct SignalingCoordinator {
    room: String,
    local_sid: String,
    members: Vec<String>,
}

impl SignalingCoordinator {
    pub fn new(room: &str, local_sid: &str) -> Self {
        Self {
            room: room.to_string(),
            local_sid: local_sid.to_string(),
            members: Vec::new(),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    fn known(&self, sid: &str) -> bool {
        self.members.iter().any(|m| m == sid)
    }

    /// Apply one bus event; returns the membership snapshot if it changed
    pub async fn handle_event<C: Connector, B: SignalingBus>(
        &mut self,
        event: SignalEvent,
        manager: &mut ConnectionManager<C>,
        bus: &B,
    ) -> Result<Option<Vec<String>>> {
        match event {
            SignalEvent::RoomClients(payload) => {
                self.members = payload.clients.clone();
                for sid in &payload.clients {
                    if sid != &self.local_sid {
                        manager.ensure_peer(sid)?;
                    }
                }
                manager.prune(&payload.clients).await;
                return Ok(Some(payload.clients));
            }
            SignalEvent::Offer(OfferPayload { offer, from, .. }) => {
                if !self.known(&from) {
                    tracing::warn!(from = %from, "discarding offer from peer outside the room");
                    return Ok(None);
                }
                manager.accept_offer(&from, offer).await?;
                let answer = manager.create_answer(&from).await?;
                bus.publish(SignalEvent::Answer(AnswerPayload {
                    answer,
                    room: self.room.clone(),
                    to: from,
                    from: self.local_sid.clone(),
                }))
                .await?;
            }
            SignalEvent::Answer(AnswerPayload { answer, from, .. }) => {
                if !self.known(&from) {
                    tracing::warn!(from = %from, "discarding answer from peer outside the room");
                    return Ok(None);
                }
                manager.accept_answer(&from, answer).await?;
            }
            SignalEvent::IceCandidate(CandidatePayload {
                candidate, from, ..
            }) => {
                if !self.known(&from) {
                    tracing::warn!(from = %from, "discarding candidate from peer outside the room");
                    return Ok(None);
                }
                manager.add_remote_candidate(&from, candidate).await?;
            }
            SignalEvent::JoinRoomError(payload) => {
                tracing::error!(message = %payload.message, "failed to join room");
            }
        }
        Ok(None)
    }

    /// Initiate negotiation toward a peer by publishing an offer
    pub async fn dial<C: Connector, B: SignalingBus>(
        &self,
        sid: &str,
        manager: &mut ConnectionManager<C>,
        bus: &B,
    ) -> Result<()> {
        manager.ensure_peer(sid)?;
        let offer = manager.create_offer(sid).await?;
        bus.publish(SignalEvent::Offer(OfferPayload {
            offer,
            room: self.room.clone(),
            to: sid.to_string(),
            from: self.local_sid.clone(),
        }))
        .await
    }

    /// Relay a locally gathered candidate to the peer it belongs to
    pub async fn publish_local_candidate<B: SignalingBus>(
        &self,
        sid: &str,
        candidate: IceCandidate,
        bus: &B,
    ) -> Result<()> {
        bus.publish(SignalEvent::IceCandidate(CandidatePayload {
            candidate,
            room: self.room.clone(),
            to: sid.to_string(),
            from: self.local_sid.clone(),
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PeerEvent;
    use roomdrop_core::channel::mem::{MemChannel, MemConnector, MemNetwork};
    use roomdrop_core::signal::mem::MemHub;
    use roomdrop_core::signal::RoomClientsPayload;
    use roomdrop_core::{SdpKind, SessionDescription};
    use tokio::sync::mpsc;

    fn setup() -> (
        ConnectionManager<MemConnector>,
        mpsc::UnboundedReceiver<PeerEvent<MemChannel>>,
        SignalingCoordinator,
    ) {
        let network = MemNetwork::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(network.connector("alice"), tx);
        let coordinator = SignalingCoordinator::new("room-1", "alice");
        (manager, rx, coordinator)
    }

    #[tokio::test]
    async fn test_membership_creates_and_prunes_peers() {
        let (mut manager, _events, mut coordinator) = setup();
        let hub = MemHub::new();
        let bus = hub.client("alice");

        let ev = SignalEvent::RoomClients(RoomClientsPayload {
            clients: vec!["alice".into(), "bob".into(), "carol".into()],
        });
        coordinator
            .handle_event(ev, &mut manager, &bus)
            .await
            .unwrap();
        assert!(manager.contains("bob"));
        assert!(manager.contains("carol"));
        assert!(!manager.contains("alice"));

        let ev = SignalEvent::RoomClients(RoomClientsPayload {
            clients: vec!["alice".into(), "bob".into()],
        });
        coordinator
            .handle_event(ev, &mut manager, &bus)
            .await
            .unwrap();
        assert!(!manager.contains("carol"));
    }

    #[tokio::test]
    async fn test_offer_from_stranger_is_discarded() {
        let (mut manager, _events, mut coordinator) = setup();
        let hub = MemHub::new();
        let bus = hub.client("alice");

        let ev = SignalEvent::Offer(OfferPayload {
            offer: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            },
            room: "room-1".into(),
            to: "alice".into(),
            from: "mallory".into(),
        });
        coordinator
            .handle_event(ev, &mut manager, &bus)
            .await
            .unwrap();
        assert!(!manager.contains("mallory"));
    }
}
