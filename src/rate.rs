//! Throughput tracking and adaptive capture interval.
//!
//! `FrameWindow` keeps the capture starts and completed sends of the trailing
//! window; `RateController` turns its metrics into a target interval using a
//! small additive-increase/additive-decrease rule.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// One completed capture-and-send
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSample {
    pub capture_started_at: Instant,
    pub sent_at: Instant,
}

impl FrameSample {
    pub fn latency(&self) -> Duration {
        self.sent_at.saturating_duration_since(self.capture_started_at)
    }
}

/// Throughput over the trailing window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThroughputMetrics {
    /// Captures started in the window
    pub attempted_fps: usize,
    /// Frames sent in the window
    pub completed_fps: usize,
    /// Mean capture-to-send latency of the frames sent in the window
    pub mean_latency: Option<Duration>,
}

/// Rolling window of capture starts and completed samples
#[derive(Debug)]
pub struct FrameWindow {
    window: Duration,
    started: VecDeque<Instant>,
    samples: VecDeque<FrameSample>,
}

impl FrameWindow {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            started: VecDeque::with_capacity(32),
            samples: VecDeque::with_capacity(32),
        }
    }

    pub fn record_start(&mut self, at: Instant) {
        self.started.push_back(at);
    }

    pub fn record_sample(&mut self, sample: FrameSample) {
        self.samples.push_back(sample);
    }

    /// Drop everything older than the window and summarize the rest
    pub fn metrics(&mut self, now: Instant) -> ThroughputMetrics {
        self.evict(now);

        let mean_latency = if self.samples.is_empty() {
            None
        } else {
            let total: Duration = self.samples.iter().map(FrameSample::latency).sum();
            Some(total / self.samples.len() as u32)
        };

        ThroughputMetrics {
            attempted_fps: self.started.len(),
            completed_fps: self.samples.len(),
            mean_latency,
        }
    }

    pub fn clear(&mut self) {
        self.started.clear();
        self.samples.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&ts) = self.started.front() {
            if now.saturating_duration_since(ts) >= self.window {
                self.started.pop_front();
            } else {
                break;
            }
        }
        while let Some(sample) = self.samples.front() {
            if now.saturating_duration_since(sample.sent_at) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Tunables for the interval controller
#[derive(Debug, Clone)]
pub struct RateConfig {
    pub initial_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Step taken when there is slack
    pub speed_up_step: Duration,
    /// Step taken when saturated
    pub back_off_step: Duration,
    /// Completed frames required before the controller acts at all
    pub min_samples: usize,
    pub fast_completed: usize,
    pub fast_latency: Duration,
    pub slow_latency: Duration,
    pub evaluation_period: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(100),
            speed_up_step: Duration::from_millis(5),
            back_off_step: Duration::from_millis(10),
            min_samples: 5,
            fast_completed: 8,
            fast_latency: Duration::from_millis(100),
            slow_latency: Duration::from_millis(200),
            evaluation_period: Duration::from_secs(1),
        }
    }
}

/// Compute the next target interval from the window metrics.
///
/// Returns `current` unchanged while fewer than `min_samples` frames completed.
pub fn next_interval(config: &RateConfig, current: Duration, metrics: &ThroughputMetrics) -> Duration {
    if metrics.completed_fps < config.min_samples {
        return current;
    }
    let latency = metrics.mean_latency.unwrap_or_default();

    if metrics.completed_fps >= config.fast_completed && latency < config.fast_latency {
        current
            .saturating_sub(config.speed_up_step)
            .max(config.min_interval)
    } else if metrics.completed_fps < config.min_samples || latency > config.slow_latency {
        (current + config.back_off_step).min(config.max_interval)
    } else {
        current
    }
}

/// Owns the target interval and evaluates it once per period
#[derive(Debug)]
pub struct RateController {
    config: RateConfig,
    target_interval: Duration,
    next_evaluation: Option<Instant>,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        let target_interval = config.initial_interval;
        Self {
            config,
            target_interval,
            next_evaluation: None,
        }
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    /// Start the evaluation clock
    pub fn arm(&mut self, now: Instant) {
        self.next_evaluation = Some(now + self.config.evaluation_period);
    }

    /// Feed the latest metrics; returns the new interval when it changed
    pub fn update(&mut self, metrics: &ThroughputMetrics, now: Instant) -> Option<Duration> {
        let due = self.next_evaluation.get_or_insert(now + self.config.evaluation_period);
        if now < *due {
            return None;
        }
        *due = now + self.config.evaluation_period;

        let next = next_interval(&self.config, self.target_interval, metrics);
        if next == self.target_interval {
            return None;
        }
        log::debug!(
            "Capture interval {}ms -> {}ms ({} completed, {:?} mean latency)",
            self.target_interval.as_millis(),
            next.as_millis(),
            metrics.completed_fps,
            metrics.mean_latency
        );
        self.target_interval = next;
        Some(next)
    }

    pub fn reset(&mut self) {
        self.target_interval = self.config.initial_interval;
        self.next_evaluation = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(completed: usize, latency_ms: u64) -> ThroughputMetrics {
        ThroughputMetrics {
            attempted_fps: completed,
            completed_fps: completed,
            mean_latency: Some(Duration::from_millis(latency_ms)),
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_window_metrics_and_eviction() {
        let mut window = FrameWindow::new();
        let t0 = Instant::now();

        for i in 0..4 {
            let start = t0 + ms(i * 100);
            window.record_start(start);
            window.record_sample(FrameSample {
                capture_started_at: start,
                sent_at: start + ms(20 + i * 20),
            });
        }
        window.record_start(t0 + ms(450));

        let m = window.metrics(t0 + ms(500));
        assert_eq!(m.attempted_fps, 5);
        assert_eq!(m.completed_fps, 4);
        // (20 + 40 + 60 + 80) / 4
        assert_eq!(m.mean_latency, Some(ms(50)));

        // First start (t0) and first send (t0+20) fall out of the window
        let m = window.metrics(t0 + ms(1050));
        assert_eq!(m.attempted_fps, 4);
        assert_eq!(m.completed_fps, 3);

        let m = window.metrics(t0 + ms(5000));
        assert_eq!(m, ThroughputMetrics::default());
    }

    #[test]
    fn test_window_clear() {
        let mut window = FrameWindow::new();
        let now = Instant::now();
        window.record_start(now);
        window.record_sample(FrameSample {
            capture_started_at: now,
            sent_at: now,
        });
        window.clear();
        assert_eq!(window.metrics(now), ThroughputMetrics::default());
    }

    #[test]
    fn test_speed_up_when_slack() {
        let config = RateConfig::default();
        assert_eq!(next_interval(&config, ms(100), &metrics(8, 99)), ms(95));
        assert_eq!(next_interval(&config, ms(52), &metrics(12, 10)), ms(50));
        assert_eq!(next_interval(&config, ms(50), &metrics(12, 10)), ms(50));
    }

    #[test]
    fn test_back_off_when_saturated() {
        let config = RateConfig::default();
        assert_eq!(next_interval(&config, ms(60), &metrics(6, 201)), ms(70));
        assert_eq!(next_interval(&config, ms(95), &metrics(9, 250)), ms(100));
        assert_eq!(next_interval(&config, ms(100), &metrics(9, 250)), ms(100));
    }

    #[test]
    fn test_hold_steady() {
        let config = RateConfig::default();
        // Enough samples but too few for speeding up, latency acceptable
        assert_eq!(next_interval(&config, ms(70), &metrics(6, 150)), ms(70));
        // Fast count but latency not low enough
        assert_eq!(next_interval(&config, ms(70), &metrics(10, 100)), ms(70));
        // Too few samples to evaluate
        assert_eq!(next_interval(&config, ms(70), &metrics(4, 500)), ms(70));
    }

    #[test]
    fn test_controller_evaluates_once_per_period() {
        let mut controller = RateController::new(RateConfig::default());
        let t0 = Instant::now();
        controller.arm(t0);

        let fast = metrics(10, 20);
        assert_eq!(controller.update(&fast, t0 + ms(100)), None);
        assert_eq!(controller.update(&fast, t0 + ms(900)), None);
        assert_eq!(controller.update(&fast, t0 + ms(1000)), Some(ms(95)));
        assert_eq!(controller.update(&fast, t0 + ms(1500)), None);
        assert_eq!(controller.update(&fast, t0 + ms(2000)), Some(ms(90)));
        assert_eq!(controller.target_interval(), ms(90));

        controller.reset();
        assert_eq!(controller.target_interval(), ms(100));
    }
}
