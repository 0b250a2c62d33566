//! Prediction acceptance and transcript assembly.

use crate::protocol::{PredictionResult, ServerError, ServerMessage, ServerStats};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_CONFIDENCE: f64 = 0.95;
pub const DEFAULT_SENTINEL_LABEL: &str = "neutral";
pub const DEFAULT_TRANSCRIPT_CAPACITY: usize = 10;

/// Per-label confidence requirements, keyed by lowercase label
#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    default_threshold: f64,
    overrides: HashMap<String, f64>,
}

impl ConfidenceGate {
    pub fn new(default_threshold: f64) -> Self {
        Self {
            default_threshold,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, label: &str, threshold: f64) -> Self {
        self.overrides.insert(label.to_lowercase(), threshold);
        self
    }

    pub fn threshold_for(&self, label: &str) -> f64 {
        self.overrides
            .get(&label.to_lowercase())
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn admits(&self, label: &str, confidence: f64) -> bool {
        confidence > self.threshold_for(label)
    }
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE).with_override("hmd", 0.99)
    }
}

/// Bounded FIFO of accepted labels without adjacent repeats
#[derive(Debug, Clone)]
pub struct TranscriptBuffer {
    entries: VecDeque<String>,
    capacity: usize,
}

impl TranscriptBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append a label; returns false when it repeats the last entry
    pub fn push(&mut self, label: &str) -> bool {
        if self.entries.back().map(String::as_str) == Some(label) {
            return false;
        }
        self.entries.push_back(label.to_string());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        true
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn text(&self) -> String {
        self.entries().join(" ")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for TranscriptBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSCRIPT_CAPACITY)
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub gate: ConfidenceGate,
    pub sentinel_label: String,
    pub transcript_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            gate: ConfidenceGate::default(),
            sentinel_label: DEFAULT_SENTINEL_LABEL.to_string(),
            transcript_capacity: DEFAULT_TRANSCRIPT_CAPACITY,
        }
    }
}

/// What changed after applying one server message
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorUpdate {
    /// Liveness reply, nothing to render
    Pong,
    Stats(ServerStats),
    Prediction {
        result: PredictionResult,
        appended: bool,
    },
    /// Server-reported error; `surfaced` is false for the known noisy class
    ServerError { message: String, surfaced: bool },
}

/// Consumes decoded server messages and keeps the user-facing view state
#[derive(Debug)]
pub struct PredictionAggregator {
    config: AggregatorConfig,
    stats: ServerStats,
    prediction: Option<PredictionResult>,
    transcript: TranscriptBuffer,
    processing: bool,
}

impl PredictionAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let transcript = TranscriptBuffer::new(config.transcript_capacity);
        Self {
            config,
            stats: ServerStats::default(),
            prediction: None,
            transcript,
            processing: false,
        }
    }

    pub fn apply(&mut self, message: ServerMessage) -> AggregatorUpdate {
        match message {
            ServerMessage::Pong => {
                log::debug!("🏓 Received pong from server");
                AggregatorUpdate::Pong
            }
            ServerMessage::Prediction(result) => {
                let appended = self.accept(&result);
                self.prediction = Some(result.clone());
                self.processing = false;
                AggregatorUpdate::Prediction { result, appended }
            }
            ServerMessage::Error(error) => self.server_error(error),
            ServerMessage::Stats(stats) => {
                if stats.is_ready() {
                    self.processing = true;
                }
                self.stats = stats.clone();
                AggregatorUpdate::Stats(stats)
            }
        }
    }

    fn accept(&mut self, result: &PredictionResult) -> bool {
        let label = result.predicted_class.as_str();
        if label.eq_ignore_ascii_case(&self.config.sentinel_label) {
            return false;
        }
        if !result.above_threshold || !self.config.gate.admits(label, result.confidence) {
            log::trace!(
                "Prediction '{}' ({:.3}) not accepted for transcript",
                label,
                result.confidence
            );
            return false;
        }

        let appended = self.transcript.push(label);
        if appended {
            log::info!("📝 Transcript: {}", self.transcript.text());
        }
        appended
    }

    fn server_error(&mut self, error: ServerError) -> AggregatorUpdate {
        if error.is_noise() {
            log::debug!("Ignoring non-fatal server error: {}", error.message);
            return AggregatorUpdate::ServerError {
                message: error.message,
                surfaced: false,
            };
        }
        log::error!("Server error: {}", error.message);
        self.processing = false;
        AggregatorUpdate::ServerError {
            message: error.message,
            surfaced: true,
        }
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn prediction(&self) -> Option<&PredictionResult> {
        self.prediction.as_ref()
    }

    pub fn transcript(&self) -> &TranscriptBuffer {
        &self.transcript
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn clear_transcript(&mut self) {
        self.transcript.clear();
    }

    /// Back to the initial state of a fresh session
    pub fn reset(&mut self) {
        self.stats = ServerStats::default();
        self.prediction = None;
        self.processing = false;
        self.transcript.clear();
    }
}

impl Default for PredictionAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}
