//! Socket ownership, connection lifecycle and reconnect policy.
//!
//! The manager itself is a synchronous state machine. Each `connect()` spawns
//! one socket task that reports back through `ConnectionEvent`s; the session
//! loop feeds those events into `on_opened` / `on_closed` /
//! `on_connect_failed` and acts on the returned `CloseAction`.

use crate::error::{Result, StreamError};
use crate::protocol::ClientMessage;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use strum::Display;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Messages queued for the socket writer. Frames are single-flight, so this
/// only has to absorb a frame plus the occasional control message.
pub const OUTGOING_CAPACITY: usize = 2;

/// A message for the socket writer, optionally acknowledged once written
#[derive(Debug)]
struct Outgoing {
    message: Message,
    written: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Exponential backoff for graceful server closures
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry scheduled when `attempts` retries already happened
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Reported by socket tasks, tagged with the generation of their socket
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened {
        generation: u64,
    },
    Message {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        code: Option<CloseCode>,
        reason: String,
    },
    ConnectFailed {
        generation: u64,
        error: String,
    },
}

/// What the session must do after the socket went away
#[derive(Debug, Clone, PartialEq)]
pub enum CloseAction {
    /// Server rejected an oversized frame; never reconnect
    FrameTooLarge,
    /// Retry scheduled after `delay`
    Reconnect { delay: Duration, attempt: u32 },
    /// Retry budget spent, connection is `Failed`
    Exhausted,
    /// Unexpected loss of the socket while the session is active
    StopSession { reason: String },
    /// Nothing to do (session not active)
    Idle,
}

pub struct ConnectionManager {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempts: u32,
    generation: u64,
    retrying: bool,
    retry_at: Option<Instant>,
    outgoing: Option<mpsc::Sender<Outgoing>>,
    cancel: Option<CancellationToken>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempts: 0,
            generation: 0,
            retrying: false,
            retry_at: None,
            outgoing: None,
            cancel: None,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Open a new socket to `endpoint`, replacing any previous one
    pub fn connect(&mut self, endpoint: &Url) {
        self.release();
        self.retrying = self.state == ConnectionState::Reconnecting;
        self.retry_at = None;
        self.generation += 1;
        self.state = ConnectionState::Connecting;

        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        let cancel = CancellationToken::new();
        self.outgoing = Some(tx);
        self.cancel = Some(cancel.clone());

        log::info!("🌐 Connecting to {} (generation {})", endpoint, self.generation);
        tokio::spawn(run_socket(
            endpoint.clone(),
            self.generation,
            rx,
            self.events.clone(),
            cancel,
        ));
    }

    /// Socket handshake finished; returns false for a stale socket
    pub fn on_opened(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        log::info!("✅ Connected (generation {})", generation);
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.retrying = false;

        if let Err(e) = self.send(&ClientMessage::ping()) {
            log::warn!("Failed to send liveness ping: {}", e);
        }
        true
    }

    /// Queue a message without waiting for it to be written
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        self.enqueue(message, None)
    }

    /// Queue a message; the receiver resolves once the socket has written it
    /// and errors if the socket goes away first
    pub fn send_tracked(&self, message: &ClientMessage) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(message, Some(tx))?;
        Ok(rx)
    }

    fn enqueue(&self, message: &ClientMessage, written: Option<oneshot::Sender<()>>) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(StreamError::NotConnected);
        }
        let outgoing = self.outgoing.as_ref().ok_or(StreamError::NotConnected)?;
        let text = message.encode()?;
        outgoing
            .try_send(Outgoing {
                message: Message::Text(text.into()),
                written,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => StreamError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => {
                    StreamError::Transport("socket writer has stopped".to_string())
                }
            })
    }

    /// Unsolicited closure of the current socket
    pub fn on_closed(
        &mut self,
        generation: u64,
        code: Option<CloseCode>,
        reason: &str,
        session_active: bool,
    ) -> Option<CloseAction> {
        if generation != self.generation {
            log::debug!("Ignoring close of stale socket {}", generation);
            return None;
        }
        self.release();
        log::info!("🔚 Socket closed. Code: {:?}, reason: '{}'", code, reason);

        let action = match code {
            Some(CloseCode::Size) => {
                self.state = ConnectionState::Disconnected;
                CloseAction::FrameTooLarge
            }
            Some(CloseCode::Away) if session_active => self.schedule_retry(),
            _ if session_active => {
                self.state = ConnectionState::Disconnected;
                CloseAction::StopSession {
                    reason: if reason.is_empty() {
                        format!("connection closed ({:?})", code)
                    } else {
                        reason.to_string()
                    },
                }
            }
            _ => {
                self.state = ConnectionState::Disconnected;
                CloseAction::Idle
            }
        };
        Some(action)
    }

    /// The socket could not be opened at all
    pub fn on_connect_failed(
        &mut self,
        generation: u64,
        error: &str,
        session_active: bool,
    ) -> Option<CloseAction> {
        if generation != self.generation {
            return None;
        }
        self.release();
        log::warn!("Connection attempt {} failed: {}", generation, error);

        let action = if !session_active {
            self.state = ConnectionState::Disconnected;
            CloseAction::Idle
        } else if self.retrying {
            self.schedule_retry()
        } else {
            self.state = ConnectionState::Disconnected;
            CloseAction::StopSession {
                reason: error.to_string(),
            }
        };
        Some(action)
    }

    fn schedule_retry(&mut self) -> CloseAction {
        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Failed;
            self.retry_at = None;
            log::error!(
                "❌ Giving up after {} reconnect attempts",
                self.policy.max_attempts
            );
            return CloseAction::Exhausted;
        }

        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        self.state = ConnectionState::Reconnecting;
        self.retry_at = Some(Instant::now() + delay);
        log::info!(
            "🔄 Reconnect attempt {}/{} in {}ms",
            self.attempts,
            self.policy.max_attempts,
            delay.as_millis()
        );
        CloseAction::Reconnect {
            delay,
            attempt: self.attempts,
        }
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_at.is_some()
    }

    /// Resolves when the scheduled retry is due; pending forever otherwise
    pub async fn retry_due(&self) {
        match self.retry_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    /// Consume the due retry. Whether to reconnect is the caller's decision,
    /// made against the session state at this moment.
    pub fn take_retry(&mut self) -> bool {
        self.retry_at.take().is_some()
    }

    /// Close the socket and go to `Disconnected`, whatever the current state
    pub fn close(&mut self) {
        if self.state != ConnectionState::Disconnected {
            log::info!("Closing connection ({})", self.state);
        }
        self.release();
        self.generation += 1;
        self.retry_at = None;
        self.retrying = false;
        self.state = ConnectionState::Disconnected;
    }

    /// Forget the retry budget; used when a session ends
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.outgoing = None;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.release();
    }
}

async fn run_socket(
    endpoint: Url,
    generation: u64,
    mut outgoing: mpsc::Receiver<Outgoing>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_async(endpoint.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            let _ = events.send(ConnectionEvent::ConnectFailed {
                generation,
                error: e.to_string(),
            });
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let _ = events.send(ConnectionEvent::Opened { generation });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                log::debug!("Socket {} closed locally", generation);
                break;
            }
            Some(item) = outgoing.recv() => {
                // A stalled peer blocks the write; cancellation must still win
                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        log::debug!("Socket {} cancelled during write", generation);
                        break;
                    }
                    result = write.send(item.message) => result,
                };
                match result {
                    Ok(()) => {
                        if let Some(written) = item.written {
                            let _ = written.send(());
                        }
                    }
                    Err(e) => {
                        let _ = events.send(ConnectionEvent::Closed {
                            generation,
                            code: None,
                            reason: format!("send failed: {}", e),
                        });
                        break;
                    }
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    log::trace!("📨 Received: {}", text.as_str());
                    let _ = events.send(ConnectionEvent::Message {
                        generation,
                        text: text.to_string(),
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(frame.code), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    let _ = events.send(ConnectionEvent::Closed { generation, code, reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(ConnectionEvent::Closed {
                        generation,
                        code: None,
                        reason: e.to_string(),
                    });
                    break;
                }
                None => {
                    let _ = events.send(ConnectionEvent::Closed {
                        generation,
                        code: None,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionManager::new(ReconnectPolicy::default(), tx), rx)
    }

    /// Pretend a socket of the current generation is open
    fn force_connected(manager: &mut ConnectionManager) -> mpsc::Receiver<Outgoing> {
        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        manager.generation += 1;
        manager.state = ConnectionState::Connecting;
        manager.outgoing = Some(tx);
        assert!(manager.on_opened(manager.generation));
        rx
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (0..7).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000, 10000]);
        assert_eq!(policy.delay_for(40), Duration::from_millis(10000));
    }

    #[test]
    fn test_send_requires_connection() {
        let (manager, _rx) = manager();
        assert!(matches!(
            manager.send(&ClientMessage::adjust_threshold(1.0)),
            Err(StreamError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_open_sends_ping_and_resets_attempts() {
        let (mut manager, _rx) = manager();
        manager.attempts = 3;
        let mut wire = force_connected(&mut manager);

        assert!(manager.is_connected());
        assert_eq!(manager.attempts(), 0);
        match wire.try_recv().unwrap().message {
            Message::Text(text) => assert!(text.as_str().contains(r#""type":"ping""#)),
            other => panic!("unexpected frame: {:?}", other),
        }

        manager.send(&ClientMessage::adjust_threshold(0.5)).unwrap();
        assert!(wire.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_writer_queue_is_backpressure() {
        let (mut manager, _rx) = manager();
        let mut wire = force_connected(&mut manager);
        // Ping from the open handshake plus one more fills the queue
        let mut written = manager
            .send_tracked(&ClientMessage::adjust_threshold(1.0))
            .unwrap();

        assert!(matches!(
            manager.send(&ClientMessage::adjust_threshold(2.0)),
            Err(StreamError::Backpressure)
        ));
        assert!(written.try_recv().is_err());

        // Writer acknowledges the tracked message
        let _ping = wire.try_recv().unwrap();
        let tracked = wire.try_recv().unwrap();
        tracked.written.unwrap().send(()).unwrap();
        assert!(written.await.is_ok());
    }

    #[tokio::test]
    async fn test_tracked_send_fails_when_socket_is_released() {
        let (mut manager, _rx) = manager();
        let wire = force_connected(&mut manager);
        let written = manager
            .send_tracked(&ClientMessage::adjust_threshold(1.0))
            .unwrap();

        manager.close();
        drop(wire);
        assert!(written.await.is_err());
    }

    #[tokio::test]
    async fn test_graceful_close_schedules_backoff_until_failed() {
        let (mut manager, _rx) = manager();
        let mut expected = vec![1000, 2000, 4000, 8000, 10000].into_iter();

        for attempt in 1..=5 {
            let _wire = force_connected(&mut manager);
            // Reconnected sockets reset the counter, so simulate failed retries instead
            manager.attempts = attempt - 1;
            let action = manager
                .on_closed(manager.generation(), Some(CloseCode::Away), "", true)
                .unwrap();
            assert_eq!(
                action,
                CloseAction::Reconnect {
                    delay: Duration::from_millis(expected.next().unwrap()),
                    attempt,
                }
            );
            assert_eq!(manager.state(), ConnectionState::Reconnecting);
            assert!(manager.retry_pending());
        }

        let _wire = force_connected(&mut manager);
        manager.attempts = 5;
        let action = manager
            .on_closed(manager.generation(), Some(CloseCode::Away), "", true)
            .unwrap();
        assert_eq!(action, CloseAction::Exhausted);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(!manager.retry_pending());
    }

    #[tokio::test]
    async fn test_fourth_retry_waits_eight_seconds() {
        let (mut manager, _rx) = manager();
        let _wire = force_connected(&mut manager);
        manager.attempts = 3;

        let action = manager
            .on_closed(manager.generation(), Some(CloseCode::Away), "going away", true)
            .unwrap();
        assert_eq!(
            action,
            CloseAction::Reconnect {
                delay: Duration::from_millis(8000),
                attempt: 4,
            }
        );
        assert_eq!(manager.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_retries_count_against_budget() {
        let (mut manager, _rx) = manager();
        let endpoint = Url::parse("ws://127.0.0.1:9").unwrap();
        let _wire = force_connected(&mut manager);
        manager.on_closed(manager.generation(), Some(CloseCode::Away), "", true);

        for expected_attempt in 2..=5 {
            manager.retry_due().await;
            assert!(manager.take_retry());
            manager.connect(&endpoint);
            assert_eq!(manager.state(), ConnectionState::Connecting);
            let action = manager
                .on_connect_failed(manager.generation(), "refused", true)
                .unwrap();
            assert!(
                matches!(action, CloseAction::Reconnect { attempt, .. } if attempt == expected_attempt)
            );
        }

        manager.retry_due().await;
        assert!(manager.take_retry());
        manager.connect(&endpoint);
        let action = manager
            .on_connect_failed(manager.generation(), "refused", true)
            .unwrap();
        assert_eq!(action, CloseAction::Exhausted);
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_initial_connect_failure_stops_session() {
        let (mut manager, _rx) = manager();
        manager.connect(&Url::parse("ws://127.0.0.1:9").unwrap());
        let action = manager
            .on_connect_failed(manager.generation(), "refused", true)
            .unwrap();
        assert_eq!(
            action,
            CloseAction::StopSession {
                reason: "refused".to_string()
            }
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_oversize_close_is_fatal() {
        let (mut manager, _rx) = manager();
        let _wire = force_connected(&mut manager);
        let action = manager
            .on_closed(manager.generation(), Some(CloseCode::Size), "too big", true)
            .unwrap();
        assert_eq!(action, CloseAction::FrameTooLarge);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.retry_pending());
    }

    #[tokio::test]
    async fn test_other_close_codes() {
        let (mut manager, _rx) = manager();
        let _wire = force_connected(&mut manager);
        let action = manager
            .on_closed(manager.generation(), Some(CloseCode::Error), "boom", true)
            .unwrap();
        assert_eq!(
            action,
            CloseAction::StopSession {
                reason: "boom".to_string()
            }
        );

        let _wire = force_connected(&mut manager);
        let action = manager
            .on_closed(manager.generation(), Some(CloseCode::Away), "", false)
            .unwrap();
        assert_eq!(action, CloseAction::Idle);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let (mut manager, _rx) = manager();
        let _wire = force_connected(&mut manager);
        let old = manager.generation();

        manager.close();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager
            .on_closed(old, Some(CloseCode::Away), "", true)
            .is_none());
        assert!(!manager.on_opened(old));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_retry() {
        let (mut manager, _rx) = manager();
        let _wire = force_connected(&mut manager);
        manager.on_closed(manager.generation(), Some(CloseCode::Away), "", true);
        assert!(manager.retry_pending());

        manager.close();
        assert!(!manager.retry_pending());
        assert!(!manager.take_retry());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
