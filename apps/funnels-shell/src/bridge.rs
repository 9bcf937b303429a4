use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use funnels_client_core::{
    BridgeError, BridgeMessage, HostBridge, HostCapabilities, HostDispatcher, HostError,
    TokenStore, UiEvent, UiPort,
};
use futures::StreamExt;

use crate::AppState;

/// The shell runs headless: there is no clipboard, and nobody to answer a
/// confirm, so every confirm is declined.
pub struct ShellHost;

impl HostCapabilities for ShellHost {
    fn write_clipboard(&mut self, _text: &str) -> Result<(), HostError> {
        Err(HostError::ClipboardUnavailable(
            "the shell has no clipboard".to_string(),
        ))
    }

    fn alert(&mut self, text: &str) {
        tracing::info!(target: "funnels.shell.bridge", text, "ui alert");
    }

    fn confirm(&mut self, text: &str) -> bool {
        tracing::info!(target: "funnels.shell.bridge", text, "declining ui confirm");
        false
    }
}

pub(crate) async fn bridge_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| bridge_session(state, socket))
}

/// One UI page. Its frames are bridge messages in their JSON wire form; the
/// page gets its own token listener, so token writes from other pages or
/// from `/__shell/tokens` come back as `token_sync` frames.
async fn bridge_session(state: AppState, mut socket: WebSocket) {
    let tokens = TokenStore::open(state.token_storage());
    let listener = tokens.listener_id().as_u64();
    let (mut ui, port) = HostBridge::establish();
    let dispatcher = tokio::spawn(HostDispatcher::new(ShellHost, port, tokens).run());
    tracing::debug!(target: "funnels.shell.bridge", listener, "bridge session opened");

    loop {
        tokio::select! {
            next = socket.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => forward_to_host(&ui, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            event = ui.recv() => {
                let Some(event) = event else {
                    break;
                };
                let payload = match wire_event(event) {
                    Ok(payload) => payload,
                    Err(error) => {
                        tracing::warn!(
                            target: "funnels.shell.bridge",
                            error = %error,
                            "failed to encode bridge event",
                        );
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(ui);
    match dispatcher.await {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => {
            tracing::warn!(target: "funnels.shell.bridge", error = %error, "dispatcher failed");
        }
        Err(error) => {
            tracing::warn!(target: "funnels.shell.bridge", error = %error, "dispatcher panicked");
        }
    }
    tracing::debug!(target: "funnels.shell.bridge", listener, "bridge session closed");
}

fn forward_to_host(ui: &UiPort, raw: &str) {
    let result = BridgeMessage::from_wire(raw).and_then(|message| ui.send(message));
    if let Err(error) = result {
        tracing::warn!(
            target: "funnels.shell.bridge",
            error = %error,
            "dropping bridge frame",
        );
    }
}

fn wire_event(event: UiEvent) -> Result<String, BridgeError> {
    let message = match event {
        UiEvent::TokensUpdated(tokens) => BridgeMessage::TokenSync { tokens },
        UiEvent::ConfirmAnswered {
            correlation_id,
            confirmed,
        } => BridgeMessage::ConfirmResponse {
            correlation_id,
            confirmed,
        },
    };
    message.to_wire()
}
