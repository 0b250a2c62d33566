//! Periodic capture-and-send scheduling with a single-flight capture lock.
//!
//! The scheduler owns two timers: the capture timer running at the rate
//! controller's target interval and a fixed metrics timer. Ticks that find a
//! capture already in flight are dropped, never queued.

use crate::capture::{CaptureError, CapturedFrame};
use crate::protocol::{ClientMessage, EncodedFrame};
use crate::rate::{FrameSample, FrameWindow, RateConfig, RateController, ThroughputMetrics};
use std::time::Duration;
use strum::Display;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub const DEFAULT_MAX_FRAME_KB: f64 = 2048.0;
pub const DEFAULT_METRICS_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SchedulerState {
    Idle,
    Armed,
    Capturing,
    /// Frame handed to the socket, waiting for the write to finish
    Sending,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub rate: RateConfig,
    pub metrics_period: Duration,
    pub max_frame_kb: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rate: RateConfig::default(),
            metrics_period: DEFAULT_METRICS_PERIOD,
            max_frame_kb: DEFAULT_MAX_FRAME_KB,
        }
    }
}

/// A timer that fired
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedulerTick {
    Capture,
    Metrics,
}

/// Identifies one capture; completions are matched against it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTicket {
    pub epoch: u64,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Lock acquired; request one frame from the source
    Capture(CaptureTicket),
    /// A capture is still in flight
    SkipBusy,
    /// Socket is down; the caller may try to reconnect
    SkipDisconnected,
    /// Scheduler is not running
    Idle,
}

#[derive(Debug)]
pub enum FrameOutcome {
    /// Encoded and ready to transmit
    Send(ClientMessage),
    /// Payload over the size limit, dropped
    Oversized { size_kb: f64 },
    /// Provider failed
    Failed(CaptureError),
    /// Completion from a stopped or restarted session
    Stale,
}

pub struct CaptureScheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    in_flight: bool,
    epoch: u64,
    window: FrameWindow,
    rate: RateController,
    metrics: ThroughputMetrics,
    capture_timer: Option<Interval>,
    metrics_timer: Option<Interval>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl CaptureScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let rate = RateController::new(config.rate.clone());
        Self {
            config,
            state: SchedulerState::Idle,
            in_flight: false,
            epoch: 0,
            window: FrameWindow::new(),
            rate,
            metrics: ThroughputMetrics::default(),
            capture_timer: None,
            metrics_timer: None,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != SchedulerState::Idle
    }

    pub fn target_interval(&self) -> Duration {
        self.rate.target_interval()
    }

    pub fn metrics(&self) -> ThroughputMetrics {
        self.metrics
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Arm both timers. No-op unless idle.
    pub fn start(&mut self) {
        if self.state != SchedulerState::Idle {
            return;
        }
        let now = Instant::now();
        self.state = SchedulerState::Armed;
        self.rate.arm(now);
        self.capture_timer = Some(make_timer(now, self.rate.target_interval()));
        self.metrics_timer = Some(make_timer(now, self.config.metrics_period));
        log::info!(
            "🎬 Capture started at {}ms interval",
            self.rate.target_interval().as_millis()
        );
    }

    /// Cancel timers, force the lock open and clear all counters.
    /// Safe to call in any state, any number of times.
    pub fn stop(&mut self) {
        if self.state != SchedulerState::Idle {
            log::info!(
                "🛑 Capture stopped ({} sent, {} dropped)",
                self.frames_sent,
                self.frames_dropped
            );
        }
        self.capture_timer = None;
        self.metrics_timer = None;
        self.in_flight = false;
        self.epoch += 1;
        self.state = SchedulerState::Idle;
        self.window.clear();
        self.rate.reset();
        self.metrics = ThroughputMetrics::default();
        self.frames_sent = 0;
        self.frames_dropped = 0;
    }

    /// Wait for the next timer; pending forever while idle
    pub async fn next_tick(&mut self) -> SchedulerTick {
        match (self.capture_timer.as_mut(), self.metrics_timer.as_mut()) {
            (Some(capture), Some(metrics)) => {
                tokio::select! {
                    biased;
                    _ = capture.tick() => SchedulerTick::Capture,
                    _ = metrics.tick() => SchedulerTick::Metrics,
                }
            }
            _ => std::future::pending().await,
        }
    }

    /// Capture timer fired
    pub fn on_capture_tick(&mut self, connected: bool) -> TickDecision {
        if self.state == SchedulerState::Idle {
            return TickDecision::Idle;
        }
        if self.in_flight {
            log::trace!("Frame skipped, capture already in flight");
            return TickDecision::SkipBusy;
        }
        if !connected {
            return TickDecision::SkipDisconnected;
        }

        let started_at = Instant::now();
        self.in_flight = true;
        self.state = SchedulerState::Capturing;
        self.window.record_start(started_at);
        TickDecision::Capture(CaptureTicket {
            epoch: self.epoch,
            started_at,
        })
    }

    /// Capture finished. A failed or oversized capture releases the lock; a
    /// frame to send keeps it until `record_sent` or `record_send_failed`.
    /// Tickets from a stopped session are ignored.
    pub fn on_frame(
        &mut self,
        ticket: CaptureTicket,
        result: Result<CapturedFrame, CaptureError>,
    ) -> FrameOutcome {
        if ticket.epoch != self.epoch || self.state == SchedulerState::Idle {
            return FrameOutcome::Stale;
        }

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                self.release(true);
                return FrameOutcome::Failed(e);
            }
        };

        let payload = EncodedFrame::new(&frame.jpeg, frame.width, frame.height);
        log::debug!(
            "📊 Captured {}x{} (size: ~{:.0}KB) in {}ms",
            frame.width,
            frame.height,
            payload.size_kb,
            ticket.started_at.elapsed().as_millis()
        );

        if payload.size_kb > self.config.max_frame_kb {
            self.release(true);
            return FrameOutcome::Oversized {
                size_kb: payload.size_kb,
            };
        }
        self.state = SchedulerState::Sending;
        FrameOutcome::Send(ClientMessage::frame(payload))
    }

    /// The socket finished writing the frame for `ticket`
    pub fn record_sent(&mut self, ticket: CaptureTicket) {
        if ticket.epoch != self.epoch || self.state == SchedulerState::Idle {
            return;
        }
        self.release(false);
        self.frames_sent += 1;
        self.window.record_sample(FrameSample {
            capture_started_at: ticket.started_at,
            sent_at: Instant::now(),
        });
    }

    /// The frame for `ticket` never reached the socket
    pub fn record_send_failed(&mut self, ticket: CaptureTicket) {
        if ticket.epoch != self.epoch || self.state == SchedulerState::Idle {
            return;
        }
        self.release(true);
    }

    fn release(&mut self, dropped: bool) {
        self.in_flight = false;
        self.state = SchedulerState::Armed;
        if dropped {
            self.frames_dropped += 1;
        }
    }

    /// Metrics timer fired: refresh throughput and let the rate controller
    /// retune the capture timer. Returns the new interval if it changed.
    pub fn on_metrics_tick(&mut self) -> Option<Duration> {
        if self.state == SchedulerState::Idle {
            return None;
        }
        let now = Instant::now();
        self.metrics = self.window.metrics(now);

        let interval = self.rate.update(&self.metrics, now)?;
        self.capture_timer = Some(make_timer(now, interval));
        Some(interval)
    }
}

impl Default for CaptureScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

fn make_timer(now: Instant, period: Duration) -> Interval {
    let mut timer = interval_at(now + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: usize) -> CapturedFrame {
        CapturedFrame::new(vec![0xAB; bytes], 640, 480)
    }

    fn ticket(decision: TickDecision) -> CaptureTicket {
        match decision {
            TickDecision::Capture(ticket) => ticket,
            other => panic!("expected a capture, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ticks_while_in_flight_are_dropped() {
        let mut scheduler = CaptureScheduler::default();
        scheduler.start();

        let mut issued = 0;
        let mut completed = 0;
        let mut pending: Option<CaptureTicket> = None;

        // Every capture takes three ticks to complete
        for tick in 0..30 {
            if let TickDecision::Capture(t) = scheduler.on_capture_tick(true) {
                issued += 1;
                pending = Some(t);
            }
            if tick % 3 == 2 {
                if let Some(t) = pending.take() {
                    assert!(matches!(scheduler.on_frame(t, Ok(frame(64))), FrameOutcome::Send(_)));
                    scheduler.record_sent(t);
                    completed += 1;
                }
            }
        }

        assert_eq!(issued, completed);
        assert_eq!(issued, 10);
        assert_eq!(scheduler.frames_sent(), 10);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let mut scheduler = CaptureScheduler::default();
        assert_eq!(scheduler.on_capture_tick(true), TickDecision::Idle);

        scheduler.start();
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        assert_eq!(scheduler.on_capture_tick(false), TickDecision::SkipDisconnected);

        let t = ticket(scheduler.on_capture_tick(true));
        assert_eq!(scheduler.state(), SchedulerState::Capturing);
        assert_eq!(scheduler.on_capture_tick(true), TickDecision::SkipBusy);

        scheduler.on_frame(t, Err(CaptureError::Empty));
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        assert_eq!(scheduler.frames_dropped(), 1);

        // Lock released after the failure
        assert!(matches!(scheduler.on_capture_tick(true), TickDecision::Capture(_)));
    }

    #[tokio::test]
    async fn test_late_completion_after_stop_is_discarded() {
        let mut scheduler = CaptureScheduler::default();
        scheduler.start();
        let t = ticket(scheduler.on_capture_tick(true));

        scheduler.stop();
        assert!(matches!(scheduler.on_frame(t, Ok(frame(64))), FrameOutcome::Stale));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!scheduler.is_running());

        // Restarting does not revive the old ticket either
        scheduler.start();
        assert!(matches!(scheduler.on_frame(t, Ok(frame(64))), FrameOutcome::Stale));
        assert!(matches!(scheduler.on_capture_tick(true), TickDecision::Capture(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_then_normal_frame() {
        let mut scheduler = CaptureScheduler::default();
        scheduler.start();

        let t = ticket(scheduler.on_capture_tick(true));
        match scheduler.on_frame(t, Ok(frame(2049 * 1024))) {
            FrameOutcome::Oversized { size_kb } => assert!(size_kb > 2048.0),
            other => panic!("expected oversized, got {:?}", other),
        }

        let t = ticket(scheduler.on_capture_tick(true));
        match scheduler.on_frame(t, Ok(frame(2047 * 1024))) {
            FrameOutcome::Send(ClientMessage::Frame { dimensions, .. }) => {
                assert_eq!(dimensions, "640x480")
            }
            other => panic!("expected a frame to send, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_held_until_socket_write_finishes() {
        let mut scheduler = CaptureScheduler::default();
        scheduler.start();

        let t = ticket(scheduler.on_capture_tick(true));
        assert!(matches!(scheduler.on_frame(t, Ok(frame(64))), FrameOutcome::Send(_)));
        assert_eq!(scheduler.state(), SchedulerState::Sending);
        assert_eq!(scheduler.on_capture_tick(true), TickDecision::SkipBusy);
        assert_eq!(scheduler.frames_sent(), 0);

        scheduler.record_sent(t);
        assert_eq!(scheduler.frames_sent(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Armed);

        let t = ticket(scheduler.on_capture_tick(true));
        scheduler.on_frame(t, Ok(frame(64)));
        scheduler.record_send_failed(t);
        assert_eq!(scheduler.frames_sent(), 1);
        assert_eq!(scheduler.frames_dropped(), 1);
        assert!(matches!(scheduler.on_capture_tick(true), TickDecision::Capture(_)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut scheduler = CaptureScheduler::default();
        scheduler.stop();
        scheduler.start();
        let t = ticket(scheduler.on_capture_tick(true));
        scheduler.record_sent(t);
        scheduler.stop();
        scheduler.stop();

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.frames_sent(), 0);
        assert_eq!(scheduler.metrics(), ThroughputMetrics::default());
        assert_eq!(scheduler.target_interval(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_and_rate_adapts() {
        let mut scheduler = CaptureScheduler::default();
        scheduler.start();

        let mut captures = 0;
        let mut retuned = None;
        let deadline = Instant::now() + Duration::from_millis(1550);

        while Instant::now() < deadline {
            match scheduler.next_tick().await {
                SchedulerTick::Capture => {
                    if let TickDecision::Capture(t) = scheduler.on_capture_tick(true) {
                        captures += 1;
                        // Instant, small frames: plenty of slack
                        if let FrameOutcome::Send(_) = scheduler.on_frame(t, Ok(frame(16))) {
                            scheduler.record_sent(t);
                        }
                    }
                }
                SchedulerTick::Metrics => {
                    if let Some(interval) = scheduler.on_metrics_tick() {
                        retuned = Some(interval);
                    }
                }
            }
        }

        assert!(captures >= 10, "only {} captures", captures);
        assert_eq!(retuned, Some(Duration::from_millis(95)));
        assert_eq!(scheduler.metrics().completed_fps, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_scheduler_never_ticks() {
        let mut scheduler = CaptureScheduler::default();
        let result =
            tokio::time::timeout(Duration::from_secs(5), scheduler.next_tick()).await;
        assert!(result.is_err());
    }
}
