use crate::bridge::{BridgeError, BridgeMessage, HostPort};
use crate::tokens::{ExternalTokenChanges, TokenPair, TokenStore, WriteOutcome};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("clipboard unavailable: {0}")]
    ClipboardUnavailable(String),
}

/// Capabilities only the surrounding environment can provide.
///
/// `alert` and `confirm` block the dispatcher until the user answers.
pub trait HostCapabilities {
    fn write_clipboard(&mut self, text: &str) -> Result<(), HostError>;
    fn alert(&mut self, text: &str);
    fn confirm(&mut self, text: &str) -> bool;
}

/// Host side of the bridge: serves UI requests one at a time and forwards
/// token changes written by other listeners.
///
/// The dispatcher listens for external token changes from construction on,
/// so writes that land before [`HostDispatcher::run`] is first polled are
/// still delivered.
pub struct HostDispatcher<H> {
    host: H,
    port: HostPort,
    tokens: TokenStore,
    external: ExternalTokenChanges,
}

impl<H: HostCapabilities> HostDispatcher<H> {
    pub fn new(host: H, port: HostPort, tokens: TokenStore) -> Self {
        let external = tokens.on_external_change();
        Self {
            host,
            port,
            tokens,
            external,
        }
    }

    /// Runs until the UI side of the bridge goes away and hands the host
    /// back.
    pub async fn run(mut self) -> Result<H, BridgeError> {
        let mut external_open = true;

        loop {
            tokio::select! {
                message = self.port.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    self.handle(message)?;
                }
                pair = self.external.recv(), if external_open => {
                    match pair {
                        Some(pair) => self.forward_external(pair)?,
                        None => external_open = false,
                    }
                }
            }
        }

        tracing::debug!(target: "funnels.client.host", "ui disconnected; dispatcher stopping");
        Ok(self.host)
    }

    pub fn handle(&mut self, message: BridgeMessage) -> Result<(), BridgeError> {
        match message {
            BridgeMessage::ClipboardWrite { text } => {
                if let Err(error) = self.host.write_clipboard(&text) {
                    tracing::debug!(
                        target: "funnels.client.host",
                        error = %error,
                        "clipboard write failed",
                    );
                }
            }
            BridgeMessage::Alert { text } => self.host.alert(&text),
            BridgeMessage::ConfirmRequest {
                text,
                correlation_id,
            } => {
                let confirmed = self.host.confirm(&text);
                self.port.send(BridgeMessage::ConfirmResponse {
                    correlation_id,
                    confirmed,
                })?;
            }
            BridgeMessage::TokenSync { tokens } => self.persist_tokens(&tokens),
            BridgeMessage::ConfirmResponse { correlation_id, .. } => {
                tracing::warn!(
                    target: "funnels.client.host",
                    correlation_id = ?correlation_id.as_value(),
                    "ignoring confirm response sent by the ui",
                );
            }
        }
        Ok(())
    }

    fn persist_tokens(&self, tokens: &TokenPair) {
        match self.tokens.write(tokens) {
            Ok(WriteOutcome::Updated) => {
                tracing::info!(target: "funnels.client.host", "session tokens persisted");
            }
            Ok(WriteOutcome::Unchanged) => {}
            Err(error) => {
                tracing::warn!(
                    target: "funnels.client.host",
                    error = %error,
                    "failed to persist session tokens",
                );
            }
        }
    }

    fn forward_external(&self, pair: TokenPair) -> Result<(), BridgeError> {
        self.port.send(BridgeMessage::TokenSync { tokens: pair })
    }
}
