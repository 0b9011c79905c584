// Throttled byte progress for one stream transfer

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::models::{DownloadProgress, ProgressEvent};
use super::traits::ProgressEmitter;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct State {
    bytes_done: u64,
    /// Highest `bytes_done` sent so far; nothing at or below it is sent again
    reported: u64,
    bytes_total: Option<u64>,
    /// Bytes already on disk when this attempt started (resume), excluded from the rate
    baseline: u64,
    started: Instant,
    last_emit: Option<Instant>,
}

/// Shared between the fetcher and a backend during one fetch. Emitted `bytes_done` never
/// decreases, even after `restart` resets the count when the remote refuses to resume.
#[derive(Debug)]
pub struct TransferProgress {
    stream: String,
    emitter: ProgressEmitter,
    interval: Duration,
    state: Mutex<State>,
}

impl TransferProgress {
    pub fn new(stream: impl Into<String>, emitter: ProgressEmitter, interval: Duration) -> Self {
        Self {
            stream: stream.into(),
            emitter,
            interval,
            state: Mutex::new(State {
                bytes_done: 0,
                reported: 0,
                bytes_total: None,
                baseline: 0,
                started: Instant::now(),
                last_emit: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start of an attempt resuming from `bytes` already on disk
    pub fn begin_attempt(&self, bytes: u64) {
        let mut state = self.lock();
        state.bytes_done = state.bytes_done.max(bytes);
        state.baseline = state.bytes_done;
        state.started = Instant::now();
    }

    /// Remote ignored the resume; counting starts over, silent until it passes what was
    /// already reported
    pub fn restart(&self) {
        let mut state = self.lock();
        state.bytes_done = 0;
        state.baseline = 0;
        state.started = Instant::now();
    }

    pub fn set_total(&self, total: Option<u64>) {
        if total.is_some() {
            self.lock().bytes_total = total;
        }
    }

    pub fn advance(&self, delta: u64) {
        let done = self.bytes_done().saturating_add(delta);
        self.update(done);
    }

    /// Absolute position; smaller values than already reported are ignored
    pub fn update(&self, bytes_done: u64) {
        let event = {
            let mut state = self.lock();
            if bytes_done <= state.bytes_done && state.last_emit.is_some() {
                return;
            }
            state.bytes_done = state.bytes_done.max(bytes_done);
            if state.bytes_done <= state.reported && state.last_emit.is_some() {
                return;
            }
            let now = Instant::now();
            let due = state
                .last_emit
                .map_or(true, |last| now.duration_since(last) >= self.interval);
            if !due {
                return;
            }
            state.last_emit = Some(now);
            state.reported = state.bytes_done;
            self.snapshot(&state, now)
        };
        self.emitter.emit(ProgressEvent::Transfer(event));
    }

    /// Always emitted, regardless of the throttle
    pub fn finish(&self) {
        let event = {
            let mut state = self.lock();
            if let Some(total) = state.bytes_total {
                state.bytes_done = state.bytes_done.max(total);
            }
            state.bytes_done = state.bytes_done.max(state.reported);
            let now = Instant::now();
            state.last_emit = Some(now);
            state.reported = state.bytes_done;
            let mut event = self.snapshot(&state, now);
            event.eta_seconds = Some(0);
            event
        };
        self.emitter.emit(ProgressEvent::Transfer(event));
    }

    pub fn bytes_done(&self) -> u64 {
        self.lock().bytes_done
    }

    fn snapshot(&self, state: &State, now: Instant) -> DownloadProgress {
        let elapsed = now.duration_since(state.started).as_secs_f64();
        let fresh = state.bytes_done.saturating_sub(state.baseline) as f64;
        let eta_seconds = match state.bytes_total {
            Some(total) if elapsed > 0.0 && fresh > 0.0 => {
                let rate = fresh / elapsed;
                Some((total.saturating_sub(state.bytes_done) as f64 / rate).ceil() as u64)
            }
            _ => None,
        };
        DownloadProgress {
            stream: self.stream.clone(),
            bytes_done: state.bytes_done,
            bytes_total: state.bytes_total,
            eta_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfers(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<DownloadProgress> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Transfer(p) = event {
                out.push(p);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_and_final_event() {
        let (emitter, mut rx) = ProgressEmitter::channel();
        let progress = TransferProgress::new("137", emitter, Duration::from_millis(250));
        progress.set_total(Some(1000));

        progress.update(100);
        progress.update(200);
        progress.update(300);
        tokio::time::advance(Duration::from_millis(300)).await;
        progress.update(400);
        progress.finish();

        let events = transfers(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].bytes_done, 100);
        assert_eq!(events[1].bytes_done, 400);
        assert_eq!(events[2].bytes_done, 1000);
        assert_eq!(events[2].eta_seconds, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic() {
        let (emitter, mut rx) = ProgressEmitter::channel();
        let progress = TransferProgress::new("140", emitter, Duration::ZERO);

        progress.update(500);
        progress.update(200);
        progress.advance(100);

        let done: Vec<u64> = transfers(&mut rx).iter().map(|p| p.bytes_done).collect();
        assert_eq!(done, vec![500, 600]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_never_reports_less() {
        let (emitter, mut rx) = ProgressEmitter::channel();
        let progress = TransferProgress::new("22", emitter, Duration::ZERO);

        progress.update(5000);
        progress.restart();
        progress.update(10);
        progress.update(4000);
        progress.update(6000);
        progress.finish();

        let done: Vec<u64> = transfers(&mut rx).iter().map(|p| p.bytes_done).collect();
        assert_eq!(done, vec![5000, 6000, 6000]);
        assert!(done.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eta_from_rate() {
        let (emitter, mut rx) = ProgressEmitter::channel();
        let progress = TransferProgress::new("18", emitter, Duration::ZERO);
        progress.set_total(Some(1000));
        progress.begin_attempt(0);

        tokio::time::advance(Duration::from_secs(2)).await;
        progress.update(200);

        let events = transfers(&mut rx);
        // 100 B/s with 800 B left
        assert_eq!(events.last().and_then(|p| p.eta_seconds), Some(8));
    }
}
