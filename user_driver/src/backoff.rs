// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Backoff support for polled register and completion waits.

use std::time::Duration;

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 1024;

/// Escalating backoff: spin briefly, then yield, then sleep.
pub struct Backoff {
    iteration: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { iteration: 0 }
    }

    /// Waits a little longer than the last time this was called.
    pub fn back_off(&mut self) {
        self.iteration = self.iteration.saturating_add(1);
        if self.iteration <= SPIN_LIMIT {
            std::hint::spin_loop();
        } else if self.iteration <= YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Resets the backoff to the spin phase.
    pub fn reset(&mut self) {
        self.iteration = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
