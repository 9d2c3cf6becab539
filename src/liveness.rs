//! Per-device keep-alive state machine and online/offline flap damping.
//!
//! Both types are pure: the caller feeds events together with the current time
//! or a random sample and executes the returned effects (timers, pings,
//! notifications). The LAN worker owns one of each per device.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const KA_INTERVAL_MIN: Duration = Duration::from_secs(10);
pub const KA_INTERVAL_MAX: Duration = Duration::from_secs(50);
pub const KA_JITTER: f64 = 0.1;
pub const FAST_PING_INTERVAL: Duration = Duration::from_secs(5);

pub const UNSTABLE_COUNT: usize = 10;
pub const UNSTABLE_WINDOW: Duration = Duration::from_secs(120);
pub const UNSTABLE_RESUME: Duration = Duration::from_secs(300);

/// Keep-alive and flap-damping timings of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTiming {
    pub interval_min: Duration,
    pub interval_max: Duration,
    pub fast_ping: Duration,
    /// Flips kept in the damping window
    pub unstable_count: usize,
    pub unstable_window: Duration,
    /// How long a held-back "online" waits
    pub unstable_resume: Duration,
}

impl Default for LivenessTiming {
    fn default() -> Self {
        Self {
            interval_min: KA_INTERVAL_MIN,
            interval_max: KA_INTERVAL_MAX,
            fast_ping: FAST_PING_INTERVAL,
            unstable_count: UNSTABLE_COUNT,
            unstable_window: UNSTABLE_WINDOW,
            unstable_resume: UNSTABLE_RESUME,
        }
    }
}

/// Scale `value` by a factor drawn uniformly from `[1 - ratio, 1 + ratio)`.
/// `sample` is expected in `[0, 1)`.
pub fn randomize(value: Duration, ratio: f64, sample: f64) -> Duration {
    value.mul_f64(1.0 - ratio + sample.clamp(0.0, 1.0) * 2.0 * ratio)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Fresh,
    Ping1,
    Ping2,
    Ping3,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Any datagram counted as keep-alive arrived from the device
    Heard,
    /// The device's recurring timer fired
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Re-arm the device timer, replacing any armed one
    Schedule(Duration),
    /// Send a unicast probe to the last known address
    Ping,
    WentOnline,
    WentOffline,
}

/// Keep-alive state of one device together with its backoff interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    state: LivenessState,
    interval: Duration,
    timing: LivenessTiming,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    /// A device starts `Dead` until it is heard from.
    pub fn new() -> Self {
        Self::with_timing(LivenessTiming::default())
    }

    pub fn with_timing(timing: LivenessTiming) -> Self {
        Self {
            state: LivenessState::Dead,
            interval: timing.interval_min,
            timing,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Apply an event. `sample` in `[0, 1)` drives the keep-alive jitter.
    pub fn step(self, event: LivenessEvent, sample: f64) -> (Liveness, Vec<Effect>) {
        let next = match (event, self.state) {
            (LivenessEvent::Heard, _) => LivenessState::Fresh,
            (LivenessEvent::Timer, LivenessState::Fresh) => LivenessState::Ping1,
            (LivenessEvent::Timer, LivenessState::Ping1) => LivenessState::Ping2,
            (LivenessEvent::Timer, LivenessState::Ping2) => LivenessState::Ping3,
            (LivenessEvent::Timer, LivenessState::Ping3) => LivenessState::Dead,
            (LivenessEvent::Timer, LivenessState::Dead) => return (self, Vec::new()),
        };
        self.enter(next, sample)
    }

    fn enter(mut self, next: LivenessState, sample: f64) -> (Liveness, Vec<Effect>) {
        let last = self.state;
        self.state = next;
        let mut effects = Vec::with_capacity(2);

        match next {
            LivenessState::Fresh => {
                if last == LivenessState::Dead {
                    self.interval = self.timing.interval_min;
                    effects.push(Effect::WentOnline);
                }
                self.interval = (self.interval * 2).min(self.timing.interval_max);
                effects.push(Effect::Schedule(randomize(self.interval, KA_JITTER, sample)));
            }
            LivenessState::Ping1 | LivenessState::Ping2 | LivenessState::Ping3 => {
                effects.push(Effect::Schedule(self.timing.fast_ping));
                effects.push(Effect::Ping);
            }
            LivenessState::Dead => {
                if last == LivenessState::Ping3 {
                    self.interval = self.timing.interval_min;
                    effects.push(Effect::WentOffline);
                }
            }
        }
        (self, effects)
    }
}

// -------------------------------------------------------------------------
// Flap damping
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Damping {
    /// Publish this online value now
    Apply(bool),
    /// Hold back "online" and publish it after the given delay unless a new
    /// flip arrives first
    Defer(Duration),
}

/// Sliding window over the last online/offline flips of a device.
#[derive(Debug, Clone)]
pub struct FlapDamper {
    history: VecDeque<Instant>,
    timing: LivenessTiming,
}

impl Default for FlapDamper {
    fn default() -> Self {
        Self::new()
    }
}

impl FlapDamper {
    pub fn new() -> Self {
        Self::with_timing(LivenessTiming::default())
    }

    pub fn with_timing(timing: LivenessTiming) -> Self {
        Self {
            history: VecDeque::with_capacity(timing.unstable_count + 1),
            timing,
        }
    }

    /// Record a flip. Offline is always applied. Online is applied unless the
    /// window is full and its oldest entry is within the stability threshold.
    pub fn record(&mut self, online: bool, now: Instant) -> Damping {
        self.history.push_back(now);
        if self.history.len() > self.timing.unstable_count {
            self.history.pop_front();
        }
        if !online {
            return Damping::Apply(false);
        }
        let stable = self.history.len() < self.timing.unstable_count
            || self
                .history
                .front()
                .is_some_and(|oldest| now.duration_since(*oldest) > self.timing.unstable_window);
        if stable {
            Damping::Apply(true)
        } else {
            Damping::Defer(self.timing.unstable_resume)
        }
    }
}
