//! Rolling-mean per-frame statistics, as surfaced by `get_stats`.

const WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub detection_ms: f64,
    pub tracking_ms: f64,
    pub total_ms: f64,
}

/// Fixed-size ring buffer of the last `WINDOW` frame timings, averaged on
/// read. Avoids an unbounded-growth accumulator for long-running sessions.
#[derive(Debug, Clone)]
pub struct Stats {
    detection: RingMean,
    tracking: RingMean,
    total: RingMean,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            detection: RingMean::new(),
            tracking: RingMean::new(),
            total: RingMean::new(),
        }
    }

    pub fn record(&mut self, detection_ms: f64, tracking_ms: f64, total_ms: f64) {
        self.detection.push(detection_ms);
        self.tracking.push(tracking_ms);
        self.total.push(total_ms);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            detection_ms: self.detection.mean(),
            tracking_ms: self.tracking.mean(),
            total_ms: self.total.mean(),
        }
    }
}

#[derive(Debug, Clone)]
struct RingMean {
    buf: [f64; WINDOW],
    len: usize,
    next: usize,
}

impl RingMean {
    fn new() -> Self {
        Self { buf: [0.0; WINDOW], len: 0, next: 0 }
    }

    fn push(&mut self, v: f64) {
        self.buf[self.next] = v;
        self.next = (self.next + 1) % WINDOW;
        self.len = (self.len + 1).min(WINDOW);
    }

    fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.buf[..self.len].iter().sum::<f64>() / self.len as f64
    }
}
