use std::time::{Duration, Instant};

/// Render-when-dirty pacing for the render thread.
///
/// A frame is due once a redraw has been requested and at least the minimum
/// interval has passed since the previous frame. Without a cap, a requested
/// frame is due immediately.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    min_interval: Option<Duration>,
    last_frame: Option<Instant>,
    requested: bool,
}

impl FrameScheduler {
    pub fn new(max_fps: Option<f32>) -> Self {
        let min_interval = max_fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / f64::from(fps)));
        Self {
            min_interval,
            last_frame: None,
            requested: false,
        }
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// Marks the view dirty. Repeated requests before the next frame collapse
    /// into one.
    pub fn request(&mut self) {
        self.requested = true;
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn ready_for_frame(&self, now: Instant) -> bool {
        if !self.requested {
            return false;
        }
        match (self.min_interval, self.last_frame) {
            (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
            _ => true,
        }
    }

    /// When the next requested frame becomes due; `None` while idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.requested {
            return None;
        }
        match (self.min_interval, self.last_frame) {
            (Some(interval), Some(last)) => Some(last + interval),
            _ => Some(Instant::now()),
        }
    }

    pub fn mark_rendered(&mut self, now: Instant) {
        self.last_frame = Some(now);
        self.requested = false;
    }

    pub fn reset(&mut self) {
        self.last_frame = None;
        self.requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_until_requested() {
        let scheduler = FrameScheduler::new(None);
        assert!(!scheduler.ready_for_frame(Instant::now()));
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn uncapped_request_is_due_immediately() {
        let mut scheduler = FrameScheduler::new(None);
        let now = Instant::now();
        scheduler.mark_rendered(now);
        scheduler.request();
        assert!(scheduler.ready_for_frame(now));
    }

    #[test]
    fn cap_spaces_frames() {
        let mut scheduler = FrameScheduler::new(Some(10.0));
        let start = Instant::now();
        scheduler.request();
        assert!(scheduler.ready_for_frame(start));
        scheduler.mark_rendered(start);
        assert!(!scheduler.is_requested());

        scheduler.request();
        scheduler.request();
        assert!(!scheduler.ready_for_frame(start + Duration::from_millis(50)));
        assert_eq!(scheduler.next_deadline(), Some(start + Duration::from_millis(100)));
        assert!(scheduler.ready_for_frame(start + Duration::from_millis(100)));
    }

    #[test]
    fn nonsense_cap_is_ignored() {
        assert!(FrameScheduler::new(Some(0.0)).min_interval().is_none());
        assert!(FrameScheduler::new(Some(f32::NAN)).min_interval().is_none());
    }
}
