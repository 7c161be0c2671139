use std::time::{Duration, Instant};

use crate::rng::SeededRng;

// In seconds.
const JITTER_RANGE: f32 = 0.5;

/// Retransmit interval that doubles per attempt up to a ceiling.
pub struct ExponentialBackoff {
    start_rto: Duration,
    max_rto: Duration,
    rto: Duration,
    jitter: f32,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, max_rto: Duration, rng: &mut SeededRng) -> Self {
        Self {
            start_rto,
            max_rto,
            rto: start_rto,
            jitter: Self::jitter(rng),
        }
    }

    pub fn reset(&mut self, rng: &mut SeededRng) {
        self.rto = self.start_rto;
        self.jitter = Self::jitter(rng);
    }

    pub fn rto(&self) -> Duration {
        if self.jitter < 0.0 {
            let duration = Duration::from_secs_f32(self.jitter.abs());
            self.rto.saturating_sub(duration)
        } else {
            self.rto + Duration::from_secs_f32(self.jitter)
        }
        .max(Duration::from_millis(50))
    }

    // A value between -0.25s and 0.25s
    fn jitter(rng: &mut SeededRng) -> f32 {
        rng.random::<f32>() * JITTER_RANGE - (JITTER_RANGE / 2.0)
    }

    pub fn attempt(&mut self, rng: &mut SeededRng) {
        self.jitter = Self::jitter(rng);
        self.rto = (self.rto * 2).min(self.max_rto);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Disabled,
    Armed(Instant),
}

impl Deadline {
    fn passed(&self, now: Instant) -> bool {
        matches!(self, Deadline::Armed(t) if now >= *t)
    }

    fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::Disabled => None,
            Deadline::Armed(t) => Some(*t),
        }
    }
}

/// Where a [`FlightTimer`] stands relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No flight in progress.
    Idle,
    /// Armed, neither deadline reached.
    Pending,
    /// The intermediate deadline passed: retransmit.
    Intermediate,
    /// The final deadline passed: give up.
    Final,
}

/// Intermediate (retransmit) and final (give up) deadlines for a handshake flight.
pub struct FlightTimer {
    backoff: ExponentialBackoff,
    limit: Duration,
    intermediate: Deadline,
    final_deadline: Deadline,
}

impl FlightTimer {
    pub fn new(start_rto: Duration, limit: Duration, rng: &mut SeededRng) -> Self {
        FlightTimer {
            backoff: ExponentialBackoff::new(start_rto, limit, rng),
            limit,
            intermediate: Deadline::Disabled,
            final_deadline: Deadline::Disabled,
        }
    }

    /// Start timing a new flight.
    pub fn arm(&mut self, now: Instant, rng: &mut SeededRng) {
        self.backoff.reset(rng);
        self.intermediate = Deadline::Armed(now + self.backoff.rto());
        self.final_deadline = Deadline::Armed(now + self.limit);
    }

    /// Push the intermediate deadline out after a retransmit.
    pub fn retransmitted(&mut self, now: Instant, rng: &mut SeededRng) {
        self.backoff.attempt(rng);
        self.intermediate = Deadline::Armed(now + self.backoff.rto());
    }

    pub fn stop(&mut self) {
        self.intermediate = Deadline::Disabled;
        self.final_deadline = Deadline::Disabled;
    }

    pub fn state(&self, now: Instant) -> TimerState {
        if self.final_deadline.passed(now) {
            TimerState::Final
        } else if self.intermediate.passed(now) {
            TimerState::Intermediate
        } else if self.final_deadline == Deadline::Disabled {
            TimerState::Idle
        } else {
            TimerState::Pending
        }
    }

    pub fn intermediate(&self) -> Option<Instant> {
        self.intermediate.instant()
    }

    pub fn final_deadline(&self) -> Option<Instant> {
        self.final_deadline.instant()
    }

    /// The earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.intermediate(), self.final_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
