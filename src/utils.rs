use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Download statistics with a sliding window for the current rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time total bytes
    pub total_size: usize,
    /// All-time number of captures
    pub n_captures: usize,
    /// All-time number of reported errors
    pub n_errors: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    captures: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

impl Counter {
    /// A counter with a 1 s sliding window.
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Counter {
            total_size: 0,
            n_captures: 0,
            n_errors: 0,
            t_begin: Instant::now(),
            window,
            captures: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Rate over the last window, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Captures per second over the last window
    pub fn capture_rate(&self) -> f64 {
        self.captures.len() as f64 / self.window.as_secs_f64().max(1e-6)
    }

    /// Record one downloaded capture of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        self.increment_at(Instant::now(), size);
    }

    fn increment_at(&mut self, now: Instant, size: usize) {
        self.total_size += size;
        self.n_captures += 1;

        self.captures.push_back((now, size));
        self.bytes_in_window += size;
        self.evict(now);
    }

    pub fn record_error(&mut self) {
        self.n_errors += 1;
    }

    /// Drop entries older than the window. Call periodically so the rate
    /// decays when downloads stop.
    pub fn expire(&mut self) {
        self.evict(Instant::now());
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, sz)) = self.captures.front() {
            if now.duration_since(ts) > self.window {
                self.captures.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_size = 0;
        self.n_captures = 0;
        self.n_errors = 0;
        self.t_begin = Instant::now();
        self.captures.clear();
        self.bytes_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_drops_old_captures() {
        let mut counter = Counter::with_window(Duration::from_secs(1));
        let start = Instant::now();
        counter.increment_at(start, 1024 * 1024);
        counter.increment_at(start + Duration::from_millis(500), 1024 * 1024);
        assert_eq!(counter.rate(), 2.0);
        assert_eq!(counter.capture_rate(), 2.0);

        counter.increment_at(start + Duration::from_millis(1600), 1024 * 1024);
        assert_eq!(counter.rate(), 1.0);
        assert_eq!(counter.n_captures, 3);
        assert_eq!(counter.total_size, 3 * 1024 * 1024);
    }

    #[test]
    fn reset_clears_everything() {
        let mut counter = Counter::new();
        counter.increment(10);
        counter.record_error();
        counter.reset();
        assert_eq!(counter.n_captures, 0);
        assert_eq!(counter.n_errors, 0);
        assert_eq!(counter.rate(), 0.0);
    }
}
