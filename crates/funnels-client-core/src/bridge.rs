//! Typed duplex channel between the UI program and the host environment.
//!
//! Message kinds have a fixed direction:
//! - UI -> host: `clipboard_write`, `alert`, `confirm_request`
//! - host -> UI: `confirm_response`
//! - both: `token_sync`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::tokens::TokenPair;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{kind} messages cannot be sent {direction}")]
    WrongDirection {
        kind: &'static str,
        direction: &'static str,
    },
    #[error("confirm request {0} is already outstanding")]
    DuplicateCorrelation(String),
    #[error("bridge channel closed")]
    Closed,
    #[error("invalid bridge message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Opaque id chosen by the UI program; the host echoes it back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Value);

impl CorrelationId {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn key(&self) -> String {
        self.0.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    UiToHost,
    HostToUi,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UiToHost => "ui_to_host",
            Self::HostToUi => "host_to_ui",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeMessage {
    ClipboardWrite {
        text: String,
    },
    Alert {
        text: String,
    },
    ConfirmRequest {
        text: String,
        correlation_id: CorrelationId,
    },
    ConfirmResponse {
        correlation_id: CorrelationId,
        confirmed: bool,
    },
    TokenSync {
        tokens: TokenPair,
    },
}

impl BridgeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClipboardWrite { .. } => "clipboard_write",
            Self::Alert { .. } => "alert",
            Self::ConfirmRequest { .. } => "confirm_request",
            Self::ConfirmResponse { .. } => "confirm_response",
            Self::TokenSync { .. } => "token_sync",
        }
    }

    #[must_use]
    pub fn allows(&self, direction: Direction) -> bool {
        match self {
            Self::ClipboardWrite { .. } | Self::Alert { .. } | Self::ConfirmRequest { .. } => {
                direction == Direction::UiToHost
            }
            Self::ConfirmResponse { .. } => direction == Direction::HostToUi,
            Self::TokenSync { .. } => true,
        }
    }

    pub fn to_wire(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(raw: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn check_direction(&self, direction: Direction) -> Result<(), BridgeError> {
        if self.allows(direction) {
            Ok(())
        } else {
            Err(BridgeError::WrongDirection {
                kind: self.kind(),
                direction: direction.as_str(),
            })
        }
    }
}

pub struct HostBridge;

impl HostBridge {
    /// Builds the single channel used for the lifetime of the session.
    pub fn establish() -> (UiPort, HostPort) {
        let (ui_tx, host_rx) = mpsc::unbounded_channel();
        let (host_tx, ui_rx) = mpsc::unbounded_channel();
        (
            UiPort {
                outbound: ui_tx,
                inbound: ui_rx,
                pending: Arc::new(Mutex::new(HashMap::new())),
            },
            HostPort {
                outbound: host_tx,
                inbound: host_rx,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    TokensUpdated(TokenPair),
    /// Answer to a confirm request sent through [`UiPort::send`] rather than
    /// [`UiPort::confirm`].
    ConfirmAnswered {
        correlation_id: CorrelationId,
        confirmed: bool,
    },
}

enum PendingEntry {
    Awaiting(oneshot::Sender<bool>),
    Surfaced,
}

type PendingConfirms = HashMap<String, PendingEntry>;

pub struct UiPort {
    outbound: mpsc::UnboundedSender<BridgeMessage>,
    inbound: mpsc::UnboundedReceiver<BridgeMessage>,
    pending: Arc<Mutex<PendingConfirms>>,
}

impl UiPort {
    pub fn send(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        message.check_direction(Direction::UiToHost)?;
        let surfaced = match &message {
            BridgeMessage::ConfirmRequest { correlation_id, .. } => {
                self.register(correlation_id, PendingEntry::Surfaced)?;
                Some(correlation_id.key())
            }
            _ => None,
        };
        if self.outbound.send(message).is_err() {
            if let Some(key) = surfaced {
                self.lock_pending().remove(&key);
            }
            return Err(BridgeError::Closed);
        }
        Ok(())
    }

    /// Sends a confirm request and returns a handle resolved by the matching
    /// response. Resolution requires someone to keep calling [`UiPort::recv`].
    /// There is no timeout.
    pub fn confirm(
        &self,
        text: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Result<PendingConfirm, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.register(&correlation_id, PendingEntry::Awaiting(tx))?;
        let message = BridgeMessage::ConfirmRequest {
            text: text.into(),
            correlation_id: correlation_id.clone(),
        };
        if self.outbound.send(message).is_err() {
            self.lock_pending().remove(&correlation_id.key());
            return Err(BridgeError::Closed);
        }
        Ok(PendingConfirm { receiver: rx })
    }

    /// Next event for the UI program. Confirm responses for
    /// [`UiPort::confirm`] handles are routed internally and not returned.
    pub async fn recv(&mut self) -> Option<UiEvent> {
        while let Some(message) = self.inbound.recv().await {
            if let Some(event) = self.route(message) {
                return Some(event);
            }
        }
        None
    }

    pub fn outstanding_confirms(&self) -> usize {
        self.lock_pending().len()
    }

    fn route(&self, message: BridgeMessage) -> Option<UiEvent> {
        match message {
            BridgeMessage::TokenSync { tokens } => Some(UiEvent::TokensUpdated(tokens)),
            BridgeMessage::ConfirmResponse {
                correlation_id,
                confirmed,
            } => {
                let entry = self.lock_pending().remove(&correlation_id.key());
                match entry {
                    Some(PendingEntry::Awaiting(waiter)) => {
                        // The caller may have dropped its handle.
                        let _ = waiter.send(confirmed);
                        None
                    }
                    Some(PendingEntry::Surfaced) => Some(UiEvent::ConfirmAnswered {
                        correlation_id,
                        confirmed,
                    }),
                    None => {
                        tracing::warn!(
                            target: "funnels.client.bridge",
                            correlation_id = %correlation_id.key(),
                            "confirm response without pending request",
                        );
                        None
                    }
                }
            }
            other => {
                tracing::warn!(
                    target: "funnels.client.bridge",
                    kind = other.kind(),
                    "dropping message with wrong direction",
                );
                None
            }
        }
    }

    fn register(
        &self,
        correlation_id: &CorrelationId,
        entry: PendingEntry,
    ) -> Result<(), BridgeError> {
        let key = correlation_id.key();
        let mut pending = self.lock_pending();
        if pending.contains_key(&key) {
            return Err(BridgeError::DuplicateCorrelation(key));
        }
        pending.insert(key, entry);
        Ok(())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingConfirms> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
#[must_use = "a pending confirm resolves only when awaited"]
pub struct PendingConfirm {
    receiver: oneshot::Receiver<bool>,
}

impl PendingConfirm {
    pub async fn answer(self) -> Result<bool, BridgeError> {
        self.receiver.await.map_err(|_| BridgeError::Closed)
    }
}

pub struct HostPort {
    outbound: mpsc::UnboundedSender<BridgeMessage>,
    inbound: mpsc::UnboundedReceiver<BridgeMessage>,
}

impl HostPort {
    pub fn send(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        message.check_direction(Direction::HostToUi)?;
        self.outbound.send(message).map_err(|_| BridgeError::Closed)
    }

    pub async fn recv(&mut self) -> Option<BridgeMessage> {
        self.inbound.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: i64, confirmed: bool) -> BridgeMessage {
        BridgeMessage::ConfirmResponse {
            correlation_id: CorrelationId::new(id),
            confirmed,
        }
    }

    #[test]
    fn wire_format_is_kind_tagged() {
        let message = BridgeMessage::ConfirmRequest {
            text: "Delete funnel?".to_string(),
            correlation_id: CorrelationId::new(json!({"funnel": 7})),
        };
        let encoded: Value =
            serde_json::from_str(&message.to_wire().expect("encode")).expect("json");
        assert_eq!(
            encoded,
            json!({
                "kind": "confirm_request",
                "text": "Delete funnel?",
                "correlation_id": {"funnel": 7}
            })
        );
        assert_eq!(
            BridgeMessage::from_wire(&encoded.to_string()).expect("decode"),
            message
        );
    }

    #[test]
    fn directions_are_fixed_per_kind() {
        let (ui, host) = HostBridge::establish();

        let error = ui.send(response(1, true)).expect_err("ui cannot answer");
        assert!(matches!(
            error,
            BridgeError::WrongDirection {
                kind: "confirm_response",
                ..
            }
        ));

        for message in [
            BridgeMessage::Alert {
                text: "hi".to_string(),
            },
            BridgeMessage::ClipboardWrite {
                text: "hi".to_string(),
            },
            BridgeMessage::ConfirmRequest {
                text: "ok?".to_string(),
                correlation_id: CorrelationId::new(1),
            },
        ] {
            assert!(host.send(message).is_err());
        }

        assert!(
            host.send(BridgeMessage::TokenSync {
                tokens: TokenPair::new("a", "r"),
            })
            .is_ok()
        );
    }

    #[tokio::test]
    async fn out_of_order_responses_resolve_matching_confirms() {
        let (mut ui, mut host) = HostBridge::establish();

        let first = ui
            .confirm("first?", CorrelationId::new(1))
            .expect("confirm 1");
        let second = ui
            .confirm("second?", CorrelationId::new("two"))
            .expect("confirm 2");
        assert_eq!(ui.outstanding_confirms(), 2);

        let mut ids = Vec::new();
        for _ in 0..2 {
            match host.recv().await {
                Some(BridgeMessage::ConfirmRequest { correlation_id, .. }) => {
                    ids.push(correlation_id);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }

        host.send(BridgeMessage::ConfirmResponse {
            correlation_id: ids[1].clone(),
            confirmed: false,
        })
        .expect("respond 2");
        host.send(BridgeMessage::ConfirmResponse {
            correlation_id: ids[0].clone(),
            confirmed: true,
        })
        .expect("respond 1");
        host.send(BridgeMessage::TokenSync {
            tokens: TokenPair::new("a2", "r1"),
        })
        .expect("sync");

        assert_eq!(
            ui.recv().await,
            Some(UiEvent::TokensUpdated(TokenPair::new("a2", "r1")))
        );
        assert!(first.answer().await.expect("answer 1"));
        assert!(!second.answer().await.expect("answer 2"));
        assert_eq!(ui.outstanding_confirms(), 0);
    }

    #[tokio::test]
    async fn raw_confirm_requests_surface_their_answer() {
        let (mut ui, host) = HostBridge::establish();
        ui.send(BridgeMessage::ConfirmRequest {
            text: "sure?".to_string(),
            correlation_id: CorrelationId::new(9),
        })
        .expect("send");

        host.send(response(9, true)).expect("respond");
        assert_eq!(
            ui.recv().await,
            Some(UiEvent::ConfirmAnswered {
                correlation_id: CorrelationId::new(9),
                confirmed: true,
            })
        );
    }

    #[test]
    fn duplicate_outstanding_ids_are_rejected() {
        let (ui, _host) = HostBridge::establish();
        let _pending = ui.confirm("a", CorrelationId::new(3)).expect("first");
        let error = ui
            .confirm("b", CorrelationId::new(3))
            .expect_err("duplicate id");
        assert!(matches!(error, BridgeError::DuplicateCorrelation(_)));
    }

    #[tokio::test]
    async fn unknown_responses_are_dropped() {
        let (mut ui, host) = HostBridge::establish();
        host.send(response(42, true)).expect("respond");
        drop(host);
        assert_eq!(ui.recv().await, None);
    }

    #[test]
    fn failed_send_releases_the_correlation_id() {
        let (ui, host) = HostBridge::establish();
        drop(host);

        let request = || BridgeMessage::ConfirmRequest {
            text: "sure?".to_string(),
            correlation_id: CorrelationId::new(4),
        };
        assert!(matches!(ui.send(request()), Err(BridgeError::Closed)));
        assert_eq!(ui.outstanding_confirms(), 0);
        assert!(matches!(ui.send(request()), Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn dropped_host_fails_pending_confirms() {
        let (ui, host) = HostBridge::establish();
        let pending = ui.confirm("ok?", CorrelationId::new(1)).expect("confirm");
        drop(host);
        drop(ui);
        assert!(matches!(pending.answer().await, Err(BridgeError::Closed)));
    }
}
