use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::{Engine, Event, SnapshotReader, StepOutcome};
use crate::error::SimError;
use crate::memory::{IN, Memory, Pointers, ProgramFill, Word};
use crate::run::{Breakpoints, RunHandle, StopReason};
use crate::storage::{MemoryImage, StoragePort};

/// Everything a front end drives: the engine, its run loop, breakpoints, the
/// collected output and persistence through an explicit storage port.
///
/// Manual operations stop an active run loop first, so the engine only ever
/// has one writer.
pub struct Session<S> {
    engine: Arc<Mutex<Engine>>,
    reader: SnapshotReader,
    events: Receiver<Event>,
    output_log: Vec<Word>,
    breakpoints: Breakpoints,
    run: Option<RunHandle>,
    storage: S,
    config: SessionConfig,
}

impl<S: StoragePort> Session<S> {
    /// Power on with the sample program, then restore the autosaved image if
    /// the storage has one.
    pub fn open(storage: S, config: SessionConfig) -> Self {
        let memory = Memory::zeroed()
            .with_registers(config.register_seed)
            .with_program(ProgramFill::Sample);
        let mut engine = Engine::new(memory);
        let events = engine.subscribe();
        let reader = engine.reader();

        let mut session = Self {
            engine: Arc::new(Mutex::new(engine)),
            reader,
            events,
            output_log: Vec::new(),
            breakpoints: Breakpoints::new(),
            run: None,
            storage,
            config,
        };
        session.restore_autosave();
        session
    }

    fn restore_autosave(&mut self) {
        let image = match self.storage.load(None) {
            Ok(Some(image)) => image,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not read autosaved image");
                return;
            }
        };
        let restored = Memory::try_from(&image)
            .and_then(|memory| self.engine().update_memory_array(memory.cells()));
        match restored {
            Ok(()) => debug!("restored autosaved image"),
            Err(e) => warn!(error = %e, "ignoring autosaved image"),
        }
    }

    fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<Memory> {
        self.reader.load()
    }

    /// A handle for observing snapshots from another thread.
    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    pub fn pointers(&self) -> Pointers {
        self.snapshot().pointers()
    }

    pub fn is_halted(&self) -> bool {
        self.snapshot().is_halted()
    }

    pub fn history_len(&self) -> usize {
        self.engine().history_len()
    }

    /// Every value written to OUT since the last reset, oldest first.
    pub fn output_log(&mut self) -> &[Word] {
        self.drain_events();
        &self.output_log
    }

    fn drain_events(&mut self) {
        for event in self.events.try_iter() {
            match event {
                Event::Output(value) => self.output_log.push(value),
                Event::OutputCleared => self.output_log.clear(),
                Event::Published(_) => {}
            }
        }
    }

    pub fn step(&mut self) -> Result<StepOutcome, SimError> {
        self.stop_run()?;
        let outcome = self.engine().step()?;
        if let StepOutcome::Executed(_) = outcome {
            self.autosave();
        }
        Ok(outcome)
    }

    /// Undo one step. Returns `false` if there is nothing to undo.
    pub fn step_back(&mut self) -> Result<bool, SimError> {
        self.stop_run()?;
        let undone = self.engine().step_back();
        if undone {
            self.autosave();
        }
        Ok(undone)
    }

    /// True while a background run loop is executing.
    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.is_finished())
    }

    /// Start the background run loop. Returns `false` if one is already
    /// running.
    pub fn start_run(&mut self) -> Result<bool, SimError> {
        if self.is_running() {
            return Ok(false);
        }
        // Collect a loop that ended on its own.
        self.stop_run()?;
        info!(interval = ?self.config.run_interval, "run started");
        self.run = Some(RunHandle::spawn(
            Arc::clone(&self.engine),
            self.breakpoints.clone(),
            self.config.run_interval,
        ));
        Ok(true)
    }

    /// Stop the run loop, if any, and return why it ended.
    pub fn stop_run(&mut self) -> Result<Option<StopReason>, SimError> {
        let Some(run) = self.run.take() else {
            return Ok(None);
        };
        let reason = run.stop()?;
        self.autosave();
        Ok(Some(reason))
    }

    /// Block until the run loop stops on its own.
    pub fn join_run(&mut self) -> Result<Option<StopReason>, SimError> {
        let Some(run) = self.run.take() else {
            return Ok(None);
        };
        let reason = run.join()?;
        self.autosave();
        Ok(Some(reason))
    }

    /// Start the run loop if idle, stop it if running. Returns the stop
    /// reason when a loop was stopped.
    pub fn toggle_run(&mut self) -> Result<Option<StopReason>, SimError> {
        if self.is_running() {
            self.stop_run()
        } else {
            self.start_run()?;
            Ok(None)
        }
    }

    /// Reset registers (ROM is kept) and clear the output log.
    pub fn reset(&mut self) -> Result<(), SimError> {
        self.stop_run()?;
        self.engine().reset(self.config.register_seed);
        self.drain_events();
        self.autosave();
        Ok(())
    }

    /// Save a backup named `before_clear_<unix-seconds>`, reset, and empty ROM.
    /// A second clear within the same second gets a `_2`, `_3`, ... suffix.
    /// Returns the backup name.
    pub fn clear_program(&mut self) -> Result<String, SimError> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let stem = format!("before_clear_{secs}");
        let mut backup = stem.clone();
        let mut n = 1;
        while self.storage.load(Some(&backup))?.is_some() {
            n += 1;
            backup = format!("{stem}_{n}");
        }
        self.save_as(&backup)?;

        self.reset()?;
        self.engine().reset_program(ProgramFill::Empty);
        self.autosave();
        Ok(backup)
    }

    /// Set one cell by hand. Stops a running loop first and clears the undo
    /// history.
    pub fn update_memory(&mut self, addr: usize, value: Word) -> Result<(), SimError> {
        self.stop_run()?;
        self.engine().update_memory(addr, value)?;
        self.autosave();
        Ok(())
    }

    /// Put a value on the input port.
    pub fn set_input(&mut self, value: Word) -> Result<(), SimError> {
        self.update_memory(IN, value)
    }

    pub fn toggle_breakpoint(&mut self, addr: usize) -> Result<bool, SimError> {
        self.breakpoints.toggle(addr)
    }

    pub fn has_breakpoint(&self, addr: usize) -> bool {
        self.breakpoints.contains(addr)
    }

    pub fn breakpoints(&self) -> &Breakpoints {
        &self.breakpoints
    }

    pub fn save_as(&mut self, name: &str) -> Result<(), SimError> {
        let image = MemoryImage::from(&*self.snapshot());
        self.storage.save(Some(name), &image)?;
        info!(name, "image saved");
        Ok(())
    }

    /// Replace the machine with a saved image. Returns `false` if no image
    /// of that name exists.
    pub fn load_by_name(&mut self, name: &str) -> Result<bool, SimError> {
        let Some(image) = self.storage.load(Some(name))? else {
            return Ok(false);
        };
        let memory = Memory::try_from(&image)?;

        self.stop_run()?;
        {
            let mut engine = self.engine();
            engine.reset(self.config.register_seed);
            engine.update_memory_array(memory.cells())?;
        }
        self.drain_events();
        self.autosave();
        info!(name, "image loaded");
        Ok(true)
    }

    pub fn saved_names(&self) -> Result<Vec<String>, SimError> {
        Ok(self.storage.list_names()?)
    }

    pub fn delete_program(&mut self, name: &str) -> Result<(), SimError> {
        self.storage.delete(name)?;
        Ok(())
    }

    fn autosave(&mut self) {
        if !self.config.autosave {
            return;
        }
        let image = MemoryImage::from(&*self.snapshot());
        if let Err(e) = self.storage.save(None, &image) {
            warn!(error = %e, "autosave failed");
        }
    }
}
