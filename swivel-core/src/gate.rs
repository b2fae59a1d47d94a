//! Onset gating of a plucked string.
//!
//! The gate opens on the first block whose RMS reaches `rms_up` and closes on
//! the first block whose RMS falls to `rms_down`, or once enough frequency
//! estimates have been collected. There is no debouncing, so a level hovering
//! around a threshold makes the gate chatter; callers see every flip.

/// Root-mean-square level of a block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Capturing,
}

/// What a single block did to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// Still idle.
    Quiet,
    /// A pluck started with this block.
    Opened,
    /// Still inside a pluck.
    Held,
    /// The pluck ended with this block; finalize it.
    Closed,
}

#[derive(Debug, Clone)]
pub struct OnsetGate {
    rms_up: f32,
    rms_down: f32,
    estimate_cap: usize,
    state: GateState,
}

impl OnsetGate {
    /// Creates a closed gate.
    ///
    /// # Arguments
    /// * `rms_up` - Block RMS at or above which the gate opens
    /// * `rms_down` - Block RMS at or below which an open gate closes
    /// * `estimate_cap` - Estimate count that closes the gate regardless of level
    pub fn new(rms_up: f32, rms_down: f32, estimate_cap: usize) -> Self {
        Self {
            rms_up,
            rms_down,
            estimate_cap,
            state: GateState::Idle,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Feeds one block's RMS and the number of estimates the current pluck has so far.
    ///
    /// Returns [`GateEvent::Closed`] exactly once per pluck.
    pub fn update(&mut self, level: f32, estimate_count: usize) -> GateEvent {
        match self.state {
            GateState::Idle if level >= self.rms_up => {
                self.state = GateState::Capturing;
                GateEvent::Opened
            }
            GateState::Idle => GateEvent::Quiet,
            GateState::Capturing
                if level <= self.rms_down || estimate_count >= self.estimate_cap =>
            {
                self.state = GateState::Idle;
                GateEvent::Closed
            }
            GateState::Capturing => GateEvent::Held,
        }
    }

    pub fn reset(&mut self) {
        self.state = GateState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_hysteresis() {
        let mut gate = OnsetGate::new(0.1, 0.02, 20);
        assert_eq!(gate.update(0.05, 0), GateEvent::Quiet);
        assert_eq!(gate.update(0.1, 0), GateEvent::Opened);
        // Between the thresholds the gate holds its state.
        assert_eq!(gate.update(0.05, 3), GateEvent::Held);
        assert_eq!(gate.update(0.02, 4), GateEvent::Closed);
        assert_eq!(gate.state(), GateState::Idle);
        assert_eq!(gate.update(0.05, 0), GateEvent::Quiet);
    }

    #[test]
    fn test_estimate_cap_closes_gate() {
        let mut gate = OnsetGate::new(0.1, 0.02, 20);
        gate.update(0.5, 0);
        assert_eq!(gate.update(0.5, 19), GateEvent::Held);
        assert_eq!(gate.update(0.5, 20), GateEvent::Closed);
        // Still loud: reopens on the next block.
        assert_eq!(gate.update(0.5, 0), GateEvent::Opened);
    }

    #[test]
    fn test_single_block_flips_state() {
        let mut gate = OnsetGate::new(0.1, 0.02, 20);
        let events: Vec<_> = [0.2, 0.01, 0.2, 0.01]
            .iter()
            .map(|&l| gate.update(l, 0))
            .collect();
        assert_eq!(
            events,
            vec![GateEvent::Opened, GateEvent::Closed, GateEvent::Opened, GateEvent::Closed]
        );
    }
}
