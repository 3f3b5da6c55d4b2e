use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Rolling count of dispatched events over the last `frames` progress ticks.
///
/// Written by the playback worker only; any thread may read it.
pub struct EventRate {
    history: Vec<AtomicU32>,
    current_frame: AtomicUsize,
}

impl EventRate {
    pub fn new(frames: usize) -> Self {
        let frames = frames.max(1);
        Self {
            history: (0..frames).map(|_| AtomicU32::new(0)).collect(),
            current_frame: AtomicUsize::new(0),
        }
    }

    pub fn increment(&self, by: u32) {
        let idx = self.current_frame.load(Ordering::Relaxed);
        self.history[idx].fetch_add(by, Ordering::Relaxed);
    }

    pub fn next_frame(&self) {
        let next = (self.current_frame.load(Ordering::Relaxed) + 1) % self.history.len();
        self.history[next].store(0, Ordering::Relaxed);
        self.current_frame.store(next, Ordering::Relaxed);
    }

    /// Events seen across the whole window.
    pub fn total(&self) -> u32 {
        self.history
            .iter()
            .map(|x| x.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_forgets_old_frames() {
        let rate = EventRate::new(2);
        rate.increment(3);
        rate.next_frame();
        rate.increment(4);
        assert_eq!(rate.total(), 7);

        rate.next_frame();
        assert_eq!(rate.total(), 4);
        rate.next_frame();
        assert_eq!(rate.total(), 0);
    }
}
