use std::time::{Duration, Instant};

/// Default minimum interval between blend dispatches (~12 Hz).
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(80);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Dispatch a blend job tagged with this generation.
    Run { generation: u64 },
    /// Dropped silently; a later request will cover this one.
    Dropped,
}

/// Rate limiter in front of the persistent blend renderer.
///
/// Two gates for non-forced requests: a minimum inter-call interval and at
/// most one in-flight job. Forced requests (stroke end, undo, redo, reset)
/// bypass both and bump the generation counter, superseding any in-flight
/// job — its completion is then ignored and queued stale jobs are skipped,
/// so the final visible state always reflects the latest committed mask.
pub struct UpdateThrottler {
    min_interval: Duration,
    last_started: Option<Instant>,
    in_flight: Option<u64>,
    generation: u64,
}

impl UpdateThrottler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_started: None,
            in_flight: None,
            generation: 0,
        }
    }

    pub fn request(&mut self, forced: bool) -> ThrottleDecision {
        if forced {
            self.generation += 1;
            self.in_flight = Some(self.generation);
            self.last_started = Some(Instant::now());
            return ThrottleDecision::Run {
                generation: self.generation,
            };
        }
        if self.in_flight.is_some() {
            return ThrottleDecision::Dropped;
        }
        if let Some(started) = self.last_started {
            if started.elapsed() < self.min_interval {
                return ThrottleDecision::Dropped;
            }
        }
        self.generation += 1;
        self.in_flight = Some(self.generation);
        self.last_started = Some(Instant::now());
        ThrottleDecision::Run {
            generation: self.generation,
        }
    }

    /// Marks a dispatched job as finished. Completions of superseded
    /// generations are ignored.
    pub fn finish(&mut self, generation: u64) {
        if self.in_flight == Some(generation) {
            self.in_flight = None;
        }
    }

    /// Whether a job generation is still the latest one issued.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn latest_generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_generation(d: ThrottleDecision) -> Option<u64> {
        match d {
            ThrottleDecision::Run { generation } => Some(generation),
            ThrottleDecision::Dropped => None,
        }
    }

    #[test]
    fn burst_of_requests_yields_one_job() {
        let mut t = UpdateThrottler::new(Duration::from_millis(200));
        let mut executed = 0;
        for _ in 0..10 {
            if let ThrottleDecision::Run { generation } = t.request(false) {
                executed += 1;
                t.finish(generation);
            }
        }
        assert_eq!(executed, 1);
    }

    #[test]
    fn in_flight_job_gates_even_after_interval() {
        let mut t = UpdateThrottler::new(Duration::from_millis(1));
        let generation = run_generation(t.request(false)).expect("first request runs");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(t.request(false), ThrottleDecision::Dropped);
        t.finish(generation);
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(t.request(false), ThrottleDecision::Run { .. }));
    }

    #[test]
    fn forced_request_always_runs() {
        let mut t = UpdateThrottler::new(Duration::from_millis(200));
        assert!(matches!(t.request(false), ThrottleDecision::Run { .. }));
        // Interval not elapsed and a job in flight: forced still runs.
        assert!(matches!(t.request(true), ThrottleDecision::Run { .. }));
        assert!(matches!(t.request(true), ThrottleDecision::Run { .. }));
    }

    #[test]
    fn forced_request_supersedes_in_flight_job() {
        let mut t = UpdateThrottler::new(Duration::from_millis(200));
        let old = run_generation(t.request(false)).expect("first request runs");
        let forced = run_generation(t.request(true)).expect("forced runs");
        assert!(forced > old);
        assert!(!t.is_current(old));
        assert!(t.is_current(forced));

        // The cancelled job's completion no longer clears the gate.
        t.finish(old);
        assert_eq!(t.request(false), ThrottleDecision::Dropped);
        t.finish(forced);
        std::thread::sleep(Duration::from_millis(250));
        assert!(matches!(t.request(false), ThrottleDecision::Run { .. }));
    }

    #[test]
    fn interval_gate_reopens_after_elapse() {
        let mut t = UpdateThrottler::new(Duration::from_millis(20));
        let generation = run_generation(t.request(false)).expect("first request runs");
        t.finish(generation);
        assert_eq!(t.request(false), ThrottleDecision::Dropped);
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(t.request(false), ThrottleDecision::Run { .. }));
    }
}
