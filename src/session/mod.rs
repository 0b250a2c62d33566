//! Session controller: the top-level orchestrator the UI talks to.
//!
//! One tokio task owns the connection, scheduler and aggregator and runs a
//! single event loop over UI commands, socket events, capture completions and
//! timers. Nothing else mutates session state, so the capture lock is the only
//! thing standing between two overlapping captures.

pub mod events;

pub use events::{Alert, SessionEvent, SessionSnapshot};

use crate::aggregator::{AggregatorUpdate, PredictionAggregator};
use crate::capture::{CaptureError, CapturedFrame, FrameSource};
use crate::config::SessionConfig;
use crate::connection::{CloseAction, ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::{Result, StreamError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::scheduler::{CaptureScheduler, CaptureTicket, FrameOutcome, SchedulerTick, TickDecision};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    AdjustThreshold(f64),
    ClearTranscript,
}

/// Progress of one capture, reported back to the session loop
enum CaptureProgress {
    Captured {
        ticket: CaptureTicket,
        result: std::result::Result<CapturedFrame, CaptureError>,
    },
    /// The socket finished (or gave up on) writing the frame
    Written { ticket: CaptureTicket, ok: bool },
}

/// Handle to a running session task
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Spawn the session task. Must be called inside a tokio runtime.
    pub fn spawn(config: SessionConfig, source: Arc<dyn FrameSource>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let actor = SessionActor::new(config, source, commands_rx, events_tx.clone(), snapshot_tx);
        let task = tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            events: events_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    /// Connect if needed, then begin capturing
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Stop capturing, close the socket and reset all session state
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Best-effort tuning hint; dropped silently while not connected
    pub fn adjust_motion_threshold(&self, factor: f64) -> Result<()> {
        self.send(Command::AdjustThreshold(factor))
    }

    pub fn clear_transcript(&self) -> Result<()> {
        self.send(Command::ClearTranscript)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified whenever the snapshot changes
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Stop everything and wait for the session task to exit
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            log::error!("Session task failed: {}", e);
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::SessionClosed)
    }
}

struct SessionActor {
    config: SessionConfig,
    source: Arc<dyn FrameSource>,
    connection: ConnectionManager,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    scheduler: CaptureScheduler,
    aggregator: PredictionAggregator,
    progress_tx: mpsc::UnboundedSender<CaptureProgress>,
    progress_rx: mpsc::UnboundedReceiver<CaptureProgress>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    /// Session-active flag, read at the moment callbacks fire
    active: bool,
    /// Start capturing as soon as the socket opens
    capture_pending: bool,
    last_state: ConnectionState,
    /// Events of the current turn, sent once the snapshot is up to date
    pending: Vec<SessionEvent>,
}

impl SessionActor {
    fn new(
        config: SessionConfig,
        source: Arc<dyn FrameSource>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<SessionEvent>,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Self {
            connection: ConnectionManager::new(config.reconnect.clone(), connection_tx),
            scheduler: CaptureScheduler::new(config.scheduler.clone()),
            aggregator: PredictionAggregator::new(config.aggregator.clone()),
            config,
            source,
            connection_events: connection_rx,
            progress_tx,
            progress_rx,
            commands,
            events,
            snapshot,
            active: false,
            capture_pending: false,
            last_state: ConnectionState::Disconnected,
            pending: Vec::new(),
        }
    }

    async fn run(mut self) {
        log::info!("🚀 Session task running (endpoint {})", self.config.endpoint);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.connection_events.recv() => self.handle_connection_event(event),
                Some(progress) = self.progress_rx.recv() => self.handle_progress(progress),
                tick = self.scheduler.next_tick() => self.handle_tick(tick),
                _ = self.connection.retry_due() => self.handle_retry(),
            }
            self.publish();
        }

        self.stop();
        self.publish();
        log::info!("👋 Session task finished");
    }

    fn handle_command(&mut self, command: Command) {
        log::debug!("Command: {:?}", command);
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::AdjustThreshold(factor) => {
                if !self.connection.is_connected() {
                    log::debug!("Ignoring threshold adjustment while not connected");
                    return;
                }
                if let Err(e) = self.connection.send(&ClientMessage::adjust_threshold(factor)) {
                    log::warn!("Failed to send threshold adjustment: {}", e);
                }
            }
            Command::ClearTranscript => {
                self.aggregator.clear_transcript();
                self.emit(SessionEvent::Transcript(Vec::new()));
            }
        }
    }

    fn start(&mut self) {
        if self.active {
            log::debug!("Session already active");
            return;
        }
        self.active = true;
        self.aggregator.reset();

        if self.connection.is_connected() {
            self.scheduler.start();
            return;
        }

        self.capture_pending = true;
        match self.connection.state() {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.connection.reset_attempts();
                self.connect();
            }
            state => log::debug!("Waiting for connection ({})", state),
        }
    }

    fn stop(&mut self) {
        let was_active = self.active;
        self.halt();
        self.connection.close();
        if was_active {
            log::info!("🛑 Session stopped");
            self.emit(SessionEvent::Stopped);
        }
    }

    /// End the session without touching the connection state
    fn halt(&mut self) {
        self.active = false;
        self.capture_pending = false;
        self.scheduler.stop();
        self.connection.reset_attempts();
        self.aggregator.reset();
    }

    fn connect(&mut self) {
        self.connection.connect(&self.config.endpoint);
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { generation } => {
                if self.connection.on_opened(generation) && self.active && self.capture_pending {
                    self.capture_pending = false;
                    self.scheduler.start();
                }
            }
            ConnectionEvent::Message { generation, text } => {
                if generation == self.connection.generation() {
                    self.handle_message(&text);
                }
            }
            ConnectionEvent::Closed {
                generation,
                code,
                reason,
            } => {
                if let Some(action) =
                    self.connection
                        .on_closed(generation, code, &reason, self.active)
                {
                    self.handle_close_action(action);
                }
            }
            ConnectionEvent::ConnectFailed { generation, error } => {
                if let Some(action) =
                    self.connection
                        .on_connect_failed(generation, &error, self.active)
                {
                    self.handle_close_action(action);
                }
            }
        }
    }

    fn handle_close_action(&mut self, action: CloseAction) {
        let alert = match action {
            CloseAction::Reconnect { .. } | CloseAction::Idle => return,
            CloseAction::FrameTooLarge => Alert::FrameTooLarge,
            CloseAction::Exhausted => Alert::ConnectionFailed,
            CloseAction::StopSession { reason } => Alert::ConnectionError(reason),
        };
        let was_active = self.active;
        self.alert(alert);
        self.halt();
        if was_active {
            self.emit(SessionEvent::Stopped);
        }
    }

    fn handle_retry(&mut self) {
        if !self.connection.take_retry() {
            return;
        }
        if self.active {
            self.connect();
        } else {
            log::debug!("Session stopped before reconnect fired");
            self.connection.close();
        }
    }

    fn handle_message(&mut self, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping undecodable server message: {}", e);
                return;
            }
        };

        match self.aggregator.apply(message) {
            AggregatorUpdate::Pong => {}
            AggregatorUpdate::Stats(stats) => self.emit(SessionEvent::Stats(stats)),
            AggregatorUpdate::Prediction { result, appended } => {
                self.emit(SessionEvent::Prediction(result));
                if appended {
                    let entries = self.aggregator.transcript().entries();
                    self.emit(SessionEvent::Transcript(entries));
                }
            }
            AggregatorUpdate::ServerError {
                message,
                surfaced: true,
            } => self.alert(Alert::ServerError(message)),
            AggregatorUpdate::ServerError { surfaced: false, .. } => {}
        }
    }

    fn handle_tick(&mut self, tick: SchedulerTick) {
        match tick {
            SchedulerTick::Capture => {
                match self.scheduler.on_capture_tick(self.connection.is_connected()) {
                    TickDecision::Capture(ticket) => self.spawn_capture(ticket),
                    TickDecision::SkipDisconnected => {
                        if self.active && self.connection.state() == ConnectionState::Disconnected
                        {
                            log::info!("Socket not connected, attempting reconnection...");
                            self.connect();
                        }
                    }
                    TickDecision::SkipBusy | TickDecision::Idle => {}
                }
            }
            SchedulerTick::Metrics => {
                if let Some(interval) = self.scheduler.on_metrics_tick() {
                    log::info!("⏱️ Capture interval now {}ms", interval.as_millis());
                }
            }
        }
    }

    fn spawn_capture(&self, ticket: CaptureTicket) {
        let source = Arc::clone(&self.source);
        let progress = self.progress_tx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(source.capture())
                .catch_unwind()
                .await
                .unwrap_or(Err(CaptureError::Panicked));
            let _ = progress.send(CaptureProgress::Captured { ticket, result });
        });
    }

    fn handle_progress(&mut self, progress: CaptureProgress) {
        match progress {
            CaptureProgress::Captured { ticket, result } => self.handle_capture(ticket, result),
            CaptureProgress::Written { ticket, ok: true } => self.scheduler.record_sent(ticket),
            CaptureProgress::Written { ticket, ok: false } => {
                log::warn!("Socket went away before the frame was written");
                self.scheduler.record_send_failed(ticket);
            }
        }
    }

    fn handle_capture(
        &mut self,
        ticket: CaptureTicket,
        result: std::result::Result<CapturedFrame, CaptureError>,
    ) {
        match self.scheduler.on_frame(ticket, result) {
            FrameOutcome::Send(message) => match self.connection.send_tracked(&message) {
                Ok(written) => {
                    // The capture lock stays held until the socket write completes
                    let progress = self.progress_tx.clone();
                    tokio::spawn(async move {
                        let ok = written.await.is_ok();
                        let _ = progress.send(CaptureProgress::Written { ticket, ok });
                    });
                }
                Err(e) => {
                    log::warn!("Frame not sent: {}", e);
                    self.scheduler.record_send_failed(ticket);
                }
            },
            FrameOutcome::Oversized { size_kb } => {
                log::warn!("Frame too large ({:.0}KB), skipping", size_kb);
                self.emit(SessionEvent::FrameDropped { size_kb });
            }
            FrameOutcome::Failed(e) => log::error!("Error capturing frame: {}", e),
            FrameOutcome::Stale => log::debug!("Discarding frame captured before stop"),
        }
    }

    fn alert(&mut self, alert: Alert) {
        log::error!("{}: {}", alert.title(), alert);
        self.emit(SessionEvent::Alert(alert));
    }

    fn emit(&mut self, event: SessionEvent) {
        self.pending.push(event);
    }

    /// Refresh the snapshot, then flush the turn's events so subscribers
    /// never observe an event ahead of the state it describes
    fn publish(&mut self) {
        let state = self.connection.state();
        if state != self.last_state {
            log::info!("Connection state: {} -> {}", self.last_state, state);
            self.last_state = state;
            self.pending.insert(0, SessionEvent::StateChanged(state));
        }

        self.snapshot.send_replace(SessionSnapshot {
            connection: state,
            recording: self.active,
            stats: self.aggregator.stats().clone(),
            prediction: self.aggregator.prediction().cloned(),
            transcript: self.aggregator.transcript().entries(),
            processing: self.aggregator.is_processing(),
            metrics: self.scheduler.metrics(),
            target_interval: self.scheduler.target_interval(),
            frames_sent: self.scheduler.frames_sent(),
        });

        for event in self.pending.drain(..) {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}
