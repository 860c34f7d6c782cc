use std::time::Duration;

use crate::memory::RegisterSeed;

/// Configuration for a simulator session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Delay between steps of the automatic run loop.
    pub run_interval: Duration,
    /// Save the machine to the autosave slot after every state change.
    pub autosave: bool,
    /// Operand registers applied on power-on and on every reset.
    pub register_seed: RegisterSeed,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            run_interval: Duration::from_millis(100), // 10 steps per second
            autosave: true,
            register_seed: RegisterSeed::default(),
        }
    }
}
