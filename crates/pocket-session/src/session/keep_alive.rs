/*
[INPUT]:  Heartbeat ticks and inbound frame arrival times of one generation
[OUTPUT]: Probe / expiry decisions for the read loop
[POS]:    Session layer - liveness monitoring
[UPDATE]: When changing liveness rules or probe cadence
*/

use std::time::Duration;

use tokio::time::Instant;

/// What the read loop should do on a heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    SendProbe,
    /// Silent for the whole liveness window; reported once per episode
    Expired { silent_for: Duration },
    /// Tick belongs to a superseded generation
    Ignore,
}

/// Keep-alive state of one connection generation
#[derive(Debug, Clone)]
pub struct KeepAlive {
    generation: u64,
    interval: Duration,
    miss_threshold: u32,
    last_sent: Option<Instant>,
    last_received: Instant,
    misses: u32,
    expired: bool,
}

impl KeepAlive {
    pub fn new(generation: u64, interval: Duration, miss_threshold: u32, now: Instant) -> Self {
        Self {
            generation,
            interval,
            miss_threshold,
            last_sent: None,
            last_received: now,
            misses: 0,
            expired: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Any inbound traffic proves liveness.
    pub fn record_frame(&mut self, now: Instant) {
        self.last_received = now;
        self.misses = 0;
        self.expired = false;
    }

    pub fn record_probe(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Decide on a heartbeat tick of `generation` at `now`.
    pub fn on_tick(&mut self, generation: u64, now: Instant) -> KeepAliveAction {
        if generation != self.generation {
            return KeepAliveAction::Ignore;
        }

        let silent_for = now.saturating_duration_since(self.last_received);
        self.misses = (silent_for.as_nanos() / self.interval.as_nanos().max(1)) as u32;
        self.check_expiry(silent_for)
            .unwrap_or(KeepAliveAction::SendProbe)
    }

    /// Decide when the liveness deadline fires; never probes.
    pub fn on_deadline(&mut self, now: Instant) -> KeepAliveAction {
        let silent_for = now.saturating_duration_since(self.last_received);
        self.check_expiry(silent_for)
            .unwrap_or(KeepAliveAction::Ignore)
    }

    /// Instant at which silence becomes expiry, counted from the last frame.
    pub fn expires_at(&self) -> Instant {
        self.last_received + self.window()
    }

    fn window(&self) -> Duration {
        self.interval.saturating_mul(self.miss_threshold)
    }

    fn check_expiry(&mut self, silent_for: Duration) -> Option<KeepAliveAction> {
        if silent_for < self.window() {
            return None;
        }
        if self.expired {
            return Some(KeepAliveAction::Ignore);
        }
        self.expired = true;
        Some(KeepAliveAction::Expired { silent_for })
    }

    /// Whole heartbeat intervals without inbound traffic, as of the last tick.
    pub fn consecutive_misses(&self) -> u32 {
        self.misses
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(20);

    #[test]
    fn probes_while_traffic_flows() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(1, INTERVAL, 3, start);

        keep_alive.record_frame(start + Duration::from_secs(15));
        assert_eq!(
            keep_alive.on_tick(1, start + INTERVAL),
            KeepAliveAction::SendProbe
        );
        assert_eq!(keep_alive.consecutive_misses(), 0);
    }

    #[test]
    fn expires_once_per_silent_episode() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(1, INTERVAL, 3, start);

        assert_eq!(keep_alive.on_tick(1, start + INTERVAL), KeepAliveAction::SendProbe);
        assert_eq!(keep_alive.on_tick(1, start + INTERVAL * 2), KeepAliveAction::SendProbe);
        assert_eq!(keep_alive.consecutive_misses(), 2);
        assert_eq!(
            keep_alive.on_tick(1, start + INTERVAL * 3),
            KeepAliveAction::Expired { silent_for: INTERVAL * 3 }
        );
        assert_eq!(keep_alive.on_tick(1, start + INTERVAL * 4), KeepAliveAction::Ignore);

        // traffic starts a new episode
        keep_alive.record_frame(start + INTERVAL * 4);
        assert_eq!(keep_alive.on_tick(1, start + INTERVAL * 5), KeepAliveAction::SendProbe);
        assert!(matches!(
            keep_alive.on_tick(1, start + INTERVAL * 7),
            KeepAliveAction::Expired { .. }
        ));
    }

    #[test]
    fn deadline_counts_from_last_frame_not_from_ticks() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(1, INTERVAL, 3, start);

        // traffic just after a tick moves the deadline off the tick grid
        let last = start + INTERVAL + Duration::from_secs(1);
        keep_alive.record_frame(last);
        assert_eq!(keep_alive.expires_at(), last + INTERVAL * 3);

        let early = last + INTERVAL * 3 - Duration::from_millis(1);
        assert_eq!(keep_alive.on_deadline(early), KeepAliveAction::Ignore);
        assert_eq!(
            keep_alive.on_deadline(last + INTERVAL * 3),
            KeepAliveAction::Expired { silent_for: INTERVAL * 3 }
        );
        // the tick that follows does not report the episode twice
        assert_eq!(keep_alive.on_tick(1, start + INTERVAL * 5), KeepAliveAction::Ignore);
    }

    #[test]
    fn stale_generation_tick_is_ignored() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(2, INTERVAL, 1, start);
        assert_eq!(keep_alive.on_tick(1, start + INTERVAL * 10), KeepAliveAction::Ignore);
        assert_eq!(keep_alive.generation(), 2);
    }
}
