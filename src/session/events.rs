//! Events and observable state published to the UI

use crate::connection::ConnectionState;
use crate::protocol::{PredictionResult, ServerStats};
use crate::rate::ThroughputMetrics;
use std::fmt;
use std::time::Duration;

/// A failure the user must be told about
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// Server closed the socket because a frame was too large
    FrameTooLarge,
    /// Socket could not be opened or was lost unexpectedly
    ConnectionError(String),
    /// Reconnect attempts exhausted; manual restart required
    ConnectionFailed,
    /// Error reported by the classifier
    ServerError(String),
}

impl Alert {
    pub fn title(&self) -> &'static str {
        match self {
            Alert::FrameTooLarge => "Frame Size Error",
            Alert::ConnectionError(_) => "Connection Error",
            Alert::ConnectionFailed => "Connection Failed",
            Alert::ServerError(_) => "Server Error",
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::FrameTooLarge => write!(
                f,
                "Image frames are too large. Try reducing camera quality or resolution."
            ),
            Alert::ConnectionError(reason) => write!(f, "Lost connection to server: {}", reason),
            Alert::ConnectionFailed => write!(
                f,
                "Unable to maintain connection to server. Please check server status."
            ),
            Alert::ServerError(message) => write!(f, "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Stats(ServerStats),
    /// Live prediction, accepted into the transcript or not
    Prediction(PredictionResult),
    Transcript(Vec<String>),
    FrameDropped { size_kb: f64 },
    Alert(Alert),
    /// Capture session ended (by the user or by a fatal failure)
    Stopped,
}

/// Everything the UI renders, refreshed after every event loop turn
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub recording: bool,
    pub stats: ServerStats,
    pub prediction: Option<PredictionResult>,
    pub transcript: Vec<String>,
    pub processing: bool,
    pub metrics: ThroughputMetrics,
    pub target_interval: Duration,
    pub frames_sent: u64,
}

impl SessionSnapshot {
    pub fn transcript_text(&self) -> String {
        self.transcript.join(" ")
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            recording: false,
            stats: ServerStats::default(),
            prediction: None,
            transcript: Vec::new(),
            processing: false,
            metrics: ThroughputMetrics::default(),
            target_interval: Duration::from_millis(100),
            frames_sent: 0,
        }
    }
}
