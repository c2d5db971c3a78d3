//! Sliding anti-replay window over nonce counters.
//!
//! A ring of 64-bit blocks tracks which counters inside the window have
//! already been accepted. `check` runs before AEAD work so replays never
//! cost a decryption; `update` runs only after authentication succeeds.

use crate::core::constants::REPLAY_WINDOW_BLOCKS;

const BLOCK_BITS: u64 = u64::BITS as u64;
const BLOCK_BIT_LOG: u64 = BLOCK_BITS.trailing_zeros() as u64;
const BLOCK_MASK: u64 = (REPLAY_WINDOW_BLOCKS as u64) - 1;
const BIT_MASK: u64 = BLOCK_BITS - 1;

/// Window span in counters: one ring block is always being recycled.
pub const WINDOW_SIZE: u64 = (REPLAY_WINDOW_BLOCKS as u64 - 1) * BLOCK_BITS;

/// Bitmap ring over recently seen nonce counters.
#[derive(Debug, Clone)]
pub struct AntiReplayWindow {
    last: u64,
    ring: [u64; REPLAY_WINDOW_BLOCKS],
}

impl Default for AntiReplayWindow {
    fn default() -> Self {
        Self {
            last: 0,
            ring: [0; REPLAY_WINDOW_BLOCKS],
        }
    }
}

impl AntiReplayWindow {
    /// Whether `counter` may be accepted: newer than anything seen, or
    /// inside the window and not yet marked.
    pub fn check(&self, counter: u64) -> bool {
        if counter > self.last {
            return true;
        }
        if self.last - counter > WINDOW_SIZE {
            return false;
        }
        let index = ((counter >> BLOCK_BIT_LOG) & BLOCK_MASK) as usize;
        let bit = counter & BIT_MASK;
        self.ring[index] & (1u64 << bit) == 0
    }

    /// Mark `counter` as seen. Callers must have passed [`check`] first.
    ///
    /// Advancing past the newest counter zeroes the ring blocks the window
    /// slides over.
    ///
    /// [`check`]: AntiReplayWindow::check
    pub fn update(&mut self, counter: u64) {
        let index = counter >> BLOCK_BIT_LOG;
        if counter > self.last {
            let current = self.last >> BLOCK_BIT_LOG;
            let diff = (index - current).min(REPLAY_WINDOW_BLOCKS as u64);
            for i in current + 1..=current + diff {
                self.ring[(i & BLOCK_MASK) as usize] = 0;
            }
            self.last = counter;
        }
        let index = (index & BLOCK_MASK) as usize;
        let bit = counter & BIT_MASK;
        self.ring[index] |= 1u64 << bit;
    }

    /// Forget everything seen.
    pub fn reset(&mut self) {
        self.last = 0;
        self.ring[0] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_counters_accepted_once() {
        let mut window = AntiReplayWindow::default();
        for counter in 1..=100 {
            assert!(window.check(counter), "counter {counter} should be fresh");
            window.update(counter);
            assert!(!window.check(counter), "counter {counter} should be spent");
        }
    }

    #[test]
    fn out_of_order_inside_window() {
        let mut window = AntiReplayWindow::default();
        window.update(50);
        assert!(window.check(10));
        window.update(10);
        assert!(!window.check(10));
        assert!(window.check(11));
    }

    #[test]
    fn too_old_rejected() {
        let mut window = AntiReplayWindow::default();
        let newest = WINDOW_SIZE + 1000;
        window.update(newest);
        assert!(!window.check(newest - WINDOW_SIZE - 1));
        assert!(window.check(newest - WINDOW_SIZE));
    }

    #[test]
    fn large_jump_clears_stale_blocks() {
        let mut window = AntiReplayWindow::default();
        window.update(1);
        // Jump far beyond the ring so every block recycles.
        let far = WINDOW_SIZE * 3;
        window.update(far);
        assert!(!window.check(far));
        assert!(window.check(far - 1));
        window.update(far - 1);
        assert!(!window.check(far - 1));
    }

    #[test]
    fn reset_forgets_history() {
        let mut window = AntiReplayWindow::default();
        window.update(5);
        window.reset();
        assert!(window.check(5));
    }
}
