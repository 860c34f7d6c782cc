use std::collections::BTreeSet;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, StepOutcome};
use crate::error::SimError;
use crate::memory::{IN, ROM};

/// ROM addresses at which automatic execution pauses.
///
/// Clones share the same set, so breakpoints can be toggled while a run loop
/// is active.
#[derive(Clone, Debug, Default)]
pub struct Breakpoints {
    set: Arc<RwLock<BTreeSet<usize>>>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or remove a breakpoint. Returns `true` if `addr` is now a
    /// breakpoint.
    pub fn toggle(&self, addr: usize) -> Result<bool, SimError> {
        if !ROM.contains(&addr) {
            return Err(SimError::InvalidAddress(addr));
        }
        let mut set = self.set.write().unwrap_or_else(PoisonError::into_inner);
        if set.remove(&addr) {
            Ok(false)
        } else {
            set.insert(addr);
            Ok(true)
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.set
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&addr)
    }

    /// All breakpoints in ascending order.
    pub fn addresses(&self) -> Vec<usize> {
        self.set
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn clear(&self) {
        self.set.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Why a run loop ended. None of these is a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// PC reached a zero word.
    Halted,
    /// PC landed on a breakpoint.
    Breakpoint(usize),
    /// The instruction just executed at this address read the input port.
    AwaitingInput(usize),
    /// The step budget of a blocking run ran out.
    StepLimit,
    /// The user stopped the loop.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Halted => write!(f, "halted"),
            StopReason::Breakpoint(pc) => write!(f, "breakpoint at @{pc:02}"),
            StopReason::AwaitingInput(pc) => write!(f, "waiting for input (read IN at @{pc:02})"),
            StopReason::StepLimit => write!(f, "step limit reached"),
            StopReason::Cancelled => write!(f, "stopped"),
        }
    }
}

/// Perform one supervised step: refuse to step on HALT, step, then decide
/// whether the loop must stop before the next one.
///
/// Returns `None` when the loop may continue.
pub fn supervise_step(
    engine: &mut Engine,
    breakpoints: &Breakpoints,
) -> Result<Option<StopReason>, SimError> {
    let executed = match engine.step()? {
        StepOutcome::Halted => return Ok(Some(StopReason::Halted)),
        StepOutcome::Executed(executed) => executed,
    };

    let pc = engine.snapshot().pc();
    if breakpoints.contains(pc) {
        return Ok(Some(StopReason::Breakpoint(pc)));
    }
    if executed.instruction.src == IN {
        return Ok(Some(StopReason::AwaitingInput(executed.pc)));
    }
    Ok(None)
}

/// Run on the calling thread without any delay between steps.
///
/// `max_steps` bounds the number of executed steps; programs on this machine
/// can loop forever.
pub fn run_blocking(
    engine: &mut Engine,
    breakpoints: &Breakpoints,
    max_steps: Option<usize>,
) -> Result<StopReason, SimError> {
    let mut steps = 0;
    loop {
        if max_steps.is_some_and(|max| steps >= max) {
            return Ok(StopReason::StepLimit);
        }
        if let Some(reason) = supervise_step(engine, breakpoints)? {
            return Ok(reason);
        }
        steps += 1;
    }
}

/// A run loop executing on a background thread at a fixed cadence.
///
/// The engine is locked only for the duration of one step. Between steps the
/// loop waits for `interval` on a cancellation channel, which is the only
/// point where a stop request is observed: a step that has started always
/// completes and is recorded in history.
#[derive(Debug)]
pub struct RunHandle {
    cancel: Sender<()>,
    thread: JoinHandle<Result<StopReason, SimError>>,
}

impl RunHandle {
    pub fn spawn(engine: Arc<Mutex<Engine>>, breakpoints: Breakpoints, interval: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = thread::spawn(move || -> Result<StopReason, SimError> {
            let reason = loop {
                let stop = {
                    let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
                    supervise_step(&mut engine, &breakpoints)?
                };
                if let Some(reason) = stop {
                    break reason;
                }
                match cancelled.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break StopReason::Cancelled,
                }
            };
            info!(%reason, "run stopped");
            Ok(reason)
        });
        Self { cancel, thread }
    }

    /// True once the loop has stopped on its own or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Request cancellation and wait for the loop to exit.
    ///
    /// If the loop already stopped on its own, its own reason is returned.
    pub fn stop(self) -> Result<StopReason, SimError> {
        // The loop may have exited already and dropped its receiver.
        let _ = self.cancel.send(());
        self.join()
    }

    /// Wait for the loop to stop on its own.
    pub fn join(self) -> Result<StopReason, SimError> {
        self.thread.join().map_err(|_| SimError::RunLoopPanicked)?
    }
}
