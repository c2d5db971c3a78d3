//! Selective-acknowledgement scheduling.
//!
//! A two-state machine decides, once per inbound packet batch, whether a
//! SACK leaves immediately (duplicates or observed loss), after the 200 ms
//! delay, or not at all. The caller owns the Ack timer and the SACK
//! construction; this type only sequences the decisions.

/// What the caller must do after a [`commit`](AckScheduler::commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// Nothing to do for this batch.
    None,
    /// Stop the Ack timer and emit a SACK now.
    SendNow,
    /// Arm the Ack timer for the delayed SACK.
    StartTimer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Delay,
}

/// Per-association ack scheduling state.
#[derive(Debug, Clone)]
pub struct AckScheduler {
    state: State,
    delayed_triggered: bool,
    immediate_triggered: bool,
}

impl Default for AckScheduler {
    fn default() -> Self {
        Self {
            state: State::Idle,
            delayed_triggered: false,
            immediate_triggered: false,
        }
    }
}

impl AckScheduler {
    /// An ack must go out with this batch (duplicate or gap seen).
    pub fn trigger_immediate_ack(&mut self) {
        self.immediate_triggered = true;
    }

    /// An ack should go out within the ack delay (in-order data seen).
    pub fn trigger_delayed_ack(&mut self) {
        self.delayed_triggered = true;
    }

    /// Close out one inbound packet batch.
    ///
    /// A pending delayed ack also flushes when a second batch arrives
    /// before the timer fires, which yields the one-SACK-per-two-packets
    /// cadence of RFC 4960 §6.2.
    pub fn commit(&mut self) -> AckAction {
        let action = if self.state == State::Delay || self.immediate_triggered {
            self.state = State::Idle;
            AckAction::SendNow
        } else if self.delayed_triggered {
            self.state = State::Delay;
            AckAction::StartTimer
        } else {
            AckAction::None
        };
        self.delayed_triggered = false;
        self.immediate_triggered = false;
        action
    }

    /// The Ack timer fired; returns whether a SACK should go out.
    pub fn delay_expired(&mut self) -> bool {
        if self.state != State::Delay {
            return false;
        }
        self.state = State::Idle;
        true
    }

    /// Back to idle with nothing pending.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.delayed_triggered = false;
        self.immediate_triggered = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_batch_does_nothing() {
        let mut ack = AckScheduler::default();
        assert_eq!(ack.commit(), AckAction::None);
    }

    #[test]
    fn immediate_trigger_sends_now() {
        let mut ack = AckScheduler::default();
        ack.trigger_immediate_ack();
        assert_eq!(ack.commit(), AckAction::SendNow);
        // Triggers do not leak into the next batch.
        assert_eq!(ack.commit(), AckAction::None);
    }

    #[test]
    fn delayed_trigger_arms_the_timer_then_flushes() {
        let mut ack = AckScheduler::default();
        ack.trigger_delayed_ack();
        assert_eq!(ack.commit(), AckAction::StartTimer);
        // Second data batch before the timer fires: ack now.
        ack.trigger_delayed_ack();
        assert_eq!(ack.commit(), AckAction::SendNow);
    }

    #[test]
    fn timer_expiry_only_fires_from_delay() {
        let mut ack = AckScheduler::default();
        assert!(!ack.delay_expired());
        ack.trigger_delayed_ack();
        ack.commit();
        assert!(ack.delay_expired());
        assert!(!ack.delay_expired());
    }

    #[test]
    fn immediate_wins_over_delayed() {
        let mut ack = AckScheduler::default();
        ack.trigger_delayed_ack();
        ack.trigger_immediate_ack();
        assert_eq!(ack.commit(), AckAction::SendNow);
    }
}
