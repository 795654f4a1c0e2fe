//! WebSocket relay client
//!
//! Dials the chat relay, logs in on every connection and shuttles JSON
//! control messages in both directions. Lost connections are redialled
//! after a fixed delay until the retry budget runs out.

use crate::config::RelayConfig;
use crate::signaling::{RelayMessage, SignalingError};
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Reported to the driver
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    /// Retry budget exhausted; the client has stopped
    GaveUp,
    Message(RelayMessage),
}

#[derive(Debug)]
enum Outbound {
    Message(RelayMessage),
    Close,
}

/// How a relay session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Clean close or relay-requested disconnect
    Stop,
    /// Dropped connection; eligible for reconnect
    Lost,
}

/// Classify a close frame; normal and going-away closes are final
pub fn close_outcome(frame: Option<&CloseFrame<'_>>) -> SessionEnd {
    match frame.map(|f| f.code) {
        Some(CloseCode::Normal) | Some(CloseCode::Away) => SessionEnd::Stop,
        _ => SessionEnd::Lost,
    }
}

/// Consecutive reconnect budget, refilled by relay pings
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
        }
    }

    /// The relay is alive and talking to us
    pub fn on_ping(&mut self) {
        self.attempts = 0;
    }

    /// Consume one attempt; false when the budget is spent
    pub fn next_attempt(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Sending half held by the driver
#[derive(Debug, Clone)]
pub struct RelayHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl RelayHandle {
    pub fn send(&self, message: RelayMessage) -> Result<(), SignalingError> {
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| SignalingError::Encode("Relay client has stopped".to_string()))
    }

    /// Close the socket and stop reconnecting
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Relay connection with reconnect
pub struct RelayClient {
    config: RelayConfig,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Start the client task
    pub fn spawn(self, events: mpsc::UnboundedSender<RelayEvent>) -> RelayHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx, events));
        RelayHandle { outbound: tx }
    }

    fn login(&self) -> RelayMessage {
        RelayMessage::Login {
            username: self.config.username.clone(),
            jwt: self.config.jwt.clone(),
            dnd: self.config.dnd,
        }
    }

    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Outbound>, events: mpsc::UnboundedSender<RelayEvent>) {
        let mut policy = ReconnectPolicy::new(self.config.max_reconnects);

        loop {
            match connect_async(self.config.url.as_str()).await {
                Ok((stream, _)) => {
                    info!("Connected to relay {}", self.config.url);
                    while let Ok(stale) = outbound.try_recv() {
                        if let Outbound::Message(message) = stale {
                            debug!("Dropping {} queued while offline", message.action());
                        }
                    }
                    let _ = events.send(RelayEvent::Connected);
                    let end = self.session(stream, &mut outbound, &events, &mut policy).await;
                    let _ = events.send(RelayEvent::Disconnected);
                    if end == SessionEnd::Stop {
                        info!("Relay session closed");
                        return;
                    }
                    warn!("Lost connection to relay");
                }
                Err(e) => warn!("Failed to connect to relay {}: {}", self.config.url, e),
            }

            if !policy.next_attempt() {
                error!("Giving up on relay after {} reconnect attempts", policy.attempts());
                let _ = events.send(RelayEvent::GaveUp);
                return;
            }

            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                self.config.reconnect_delay(),
                policy.attempts(),
                self.config.max_reconnects
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                command = outbound.recv() => {
                    if matches!(command, None | Some(Outbound::Close)) {
                        return;
                    }
                }
            }
        }
    }

    async fn session(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
        events: &mpsc::UnboundedSender<RelayEvent>,
        policy: &mut ReconnectPolicy,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        if let Err(e) = send_message(&mut write, &self.login()).await {
            warn!("Failed to log in: {}", e);
            return SessionEnd::Lost;
        }

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let message = match RelayMessage::from_json(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                debug!("Ignoring relay frame: {}", e);
                                continue;
                            }
                        };
                        let stop = matches!(message, RelayMessage::Disconnect { .. });
                        if message == RelayMessage::Ping {
                            policy.on_ping();
                        }
                        if events.send(RelayEvent::Message(message)).is_err() {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Stop;
                        }
                        if stop {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Stop;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Relay closed the socket: {:?}", frame);
                        return close_outcome(frame.as_ref());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay socket error: {}", e);
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                },
                command = outbound.recv() => match command {
                    Some(Outbound::Message(message)) => {
                        if let Err(e) = send_message(&mut write, &message).await {
                            warn!("Failed to send {}: {}", message.action(), e);
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Stop;
                    }
                },
            }
        }
    }
}

async fn send_message<S>(write: &mut S, message: &RelayMessage) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = message.to_json()?;
    debug!("-> {}", message.action());
    write.send(Message::Text(json)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn frame(code: CloseCode) -> CloseFrame<'static> {
        CloseFrame {
            code,
            reason: Cow::Borrowed(""),
        }
    }

    #[test]
    fn clean_closes_stop_reconnecting() {
        assert_eq!(close_outcome(Some(&frame(CloseCode::Normal))), SessionEnd::Stop);
        assert_eq!(close_outcome(Some(&frame(CloseCode::Away))), SessionEnd::Stop);
        assert_eq!(close_outcome(Some(&frame(CloseCode::Abnormal))), SessionEnd::Lost);
        assert_eq!(close_outcome(Some(&frame(CloseCode::Error))), SessionEnd::Lost);
        assert_eq!(close_outcome(None), SessionEnd::Lost);
    }

    #[test]
    fn reconnect_budget_refills_on_ping() {
        let mut policy = ReconnectPolicy::new(3);
        assert!(policy.next_attempt());
        assert!(policy.next_attempt());
        assert!(policy.next_attempt());
        assert!(!policy.next_attempt());

        policy.on_ping();
        assert_eq!(policy.attempts(), 0);
        assert!(policy.next_attempt());
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut policy = ReconnectPolicy::new(0);
        assert!(!policy.next_attempt());
    }

    #[test]
    fn login_carries_account() {
        let client = RelayClient::new(RelayConfig {
            username: "alice".to_string(),
            jwt: Some("token".to_string()),
            dnd: true,
            ..Default::default()
        });
        let json = client.login().to_json().unwrap();
        assert!(json.contains(r#""action":"login""#));
        assert!(json.contains(r#""jwt":"token""#));
        assert!(json.contains(r#""dnd":true"#));
    }

    #[tokio::test]
    async fn unreachable_relay_gives_up() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = RelayClient::new(RelayConfig {
            url: "ws://127.0.0.1:1/ws".to_string(),
            username: "alice".to_string(),
            reconnect_delay_secs: 0,
            max_reconnects: 2,
            ..Default::default()
        });
        let _handle = client.spawn(tx);
        assert_eq!(rx.recv().await, Some(RelayEvent::GaveUp));
    }

    #[tokio::test]
    async fn handle_send_fails_after_client_stops() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = RelayHandle { outbound: tx };
        assert!(handle.send(RelayMessage::Ping).is_err());
    }
}
