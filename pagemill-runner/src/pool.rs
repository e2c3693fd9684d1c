use pagemill_core::{Command, CommandOutcome, PoolStats, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{PoolConfig, SpawnFailurePolicy};
use crate::process::{ensure_directory, ProcessHandle, Shell};

struct Occupant {
    index: usize,
    handle: ProcessHandle,
    /// Set once the handle has been seen finished and counted
    retired: bool,
}

/// Runs a backlog of shell commands with at most `max_concurrency` alive at
/// once.
///
/// `run()` fills every slot, then polls and replaces finished occupants until
/// the backlog is empty; it does not wait for the last commands. `wait()`
/// blocks until every launched command has finished. Exit codes and signals
/// are never turned into errors; enable `collect_outcomes` to inspect them.
///
/// The pool is driven from a single task. Dropping it terminates whatever is
/// still running: every command is signalled before any is waited on, so the
/// drop blocks for about one kill grace however many slots are busy.
pub struct ProcessPool {
    id: Uuid,
    config: PoolConfig,
    shell: Shell,
    working_dir: Option<PathBuf>,
    poll_interval: Duration,
    backlog: VecDeque<(usize, Command)>,
    slots: Vec<Option<Occupant>>,
    next_index: usize,
    launched: usize,
    finished: usize,
    spawn_failures: usize,
    cancelled: usize,
    peak_running: usize,
    outcomes: Vec<CommandOutcome>,
}

impl ProcessPool {
    /// Create a pool with default configuration.
    pub fn new<I, C>(commands: I, working_dir: Option<&Path>) -> Result<Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<Command>,
    {
        let mut config = PoolConfig::default();
        config.working_dir = working_dir.map(Path::to_path_buf);
        Self::with_config(commands, config)
    }

    /// Create a pool. Fails with `InvalidWorkingDirectory` before anything is
    /// spawned if the configured directory does not exist.
    pub fn with_config<I, C>(commands: I, config: PoolConfig) -> Result<Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<Command>,
    {
        config.validate()?;
        if let Some(dir) = &config.working_dir {
            ensure_directory(dir)?;
        }
        let shell = Shell::resolve(config.shell.as_deref())?;
        let max_concurrency = config.resolve_concurrency();

        let mut pool = Self {
            id: Uuid::new_v4(),
            working_dir: config.working_dir.clone(),
            poll_interval: config.poll_interval(),
            config,
            shell,
            backlog: VecDeque::new(),
            slots: (0..max_concurrency).map(|_| None).collect(),
            next_index: 0,
            launched: 0,
            finished: 0,
            spawn_failures: 0,
            cancelled: 0,
            peak_running: 0,
            outcomes: Vec::new(),
        };
        pool.submit(commands);

        debug!(
            pool_id = %pool.id,
            max_concurrency,
            pending = pool.backlog.len(),
            shell = %pool.shell.program.display(),
            "Created process pool"
        );
        Ok(pool)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn max_concurrency(&self) -> usize {
        self.slots.len()
    }

    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    /// Append commands to the backlog. They launch on the next `run()`, so a
    /// second batch can be staged as soon as the first has drained.
    pub fn submit<I, C>(&mut self, commands: I)
    where
        I: IntoIterator<Item = C>,
        C: Into<Command>,
    {
        for command in commands {
            self.backlog.push_back((self.next_index, command.into()));
            self.next_index += 1;
        }
    }

    /// Launch every backlog command, never exceeding `max_concurrency` alive
    /// at once. Returns once the backlog is empty.
    pub async fn run(&mut self) -> Result<()> {
        if self.backlog.is_empty() {
            return Ok(());
        }

        info!(
            pool_id = %self.id,
            pending = self.backlog.len(),
            max_concurrency = self.slots.len(),
            "Running backlog"
        );

        self.fill_free_slots()?;
        while !self.backlog.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
            self.fill_free_slots()?;
        }

        info!(pool_id = %self.id, launched = self.launched, "Backlog drained");
        Ok(())
    }

    /// Block until every launched command has finished. Returns immediately
    /// when nothing is running.
    pub async fn wait(&mut self) {
        loop {
            let running = self.poll_slots();
            if running == 0 {
                break;
            }
            debug!(pool_id = %self.id, running, "Waiting for running commands");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Terminate every running command, reap it and drop the backlog.
    pub async fn shutdown(&mut self) {
        let dropped = self.backlog.len();
        self.backlog.clear();
        self.cancelled += dropped;

        let mut terminated = 0;
        for occupant in self.slots.iter_mut().flatten() {
            if !occupant.retired && occupant.handle.is_running() {
                terminated += 1;
            }
            occupant.handle.request_termination();
        }

        for slot in self.slots.iter_mut() {
            let Some(occupant) = slot.take() else {
                continue;
            };
            if occupant.retired {
                continue;
            }
            let index = occupant.index;
            let mut handle = occupant.handle;
            let outcome = self.config.collect_outcomes.then(|| handle.outcome(index));
            let status = handle.close().await;
            if let Some(mut outcome) = outcome {
                outcome.status = status;
                self.outcomes.push(outcome);
            }
            self.finished += 1;
        }

        info!(
            pool_id = %self.id,
            terminated,
            dropped,
            "Pool shut down"
        );
    }

    /// Counters as of the last poll.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            launched: self.launched,
            finished: self.finished,
            running: self.live_count(),
            pending: self.backlog.len(),
            spawn_failures: self.spawn_failures,
            cancelled: self.cancelled,
            peak_running: self.peak_running,
        }
    }

    /// Outcomes recorded so far; empty unless `collect_outcomes` is set.
    pub fn outcomes(&self) -> &[CommandOutcome] {
        &self.outcomes
    }

    pub fn take_outcomes(&mut self) -> Vec<CommandOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Pids of commands not yet seen finished
    pub fn running_pids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .flatten()
            .filter(|occupant| !occupant.retired)
            .map(|occupant| occupant.handle.pid())
            .collect()
    }

    fn live_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|occupant| !occupant.retired)
            .count()
    }

    /// Poll every slot, retiring finished occupants. Returns how many are
    /// still running.
    fn poll_slots(&mut self) -> usize {
        (0..self.slots.len())
            .filter(|&slot| self.slot_running(slot))
            .count()
    }

    fn slot_running(&mut self, slot: usize) -> bool {
        let Some(occupant) = self.slots[slot].as_mut() else {
            return false;
        };
        if occupant.retired {
            return false;
        }
        let status = occupant.handle.status();
        if status.running {
            return true;
        }

        occupant.retired = true;
        self.finished += 1;
        debug!(
            pool_id = %self.id,
            slot,
            index = occupant.index,
            pid = occupant.handle.pid(),
            command = %occupant.handle.command_line(),
            exit_code = ?status.exit_code,
            signal = ?status.signal,
            stopped = status.stopped,
            "Command finished"
        );
        if self.config.collect_outcomes {
            let outcome = occupant.handle.outcome(occupant.index);
            self.outcomes.push(outcome);
        }
        false
    }

    fn fill_free_slots(&mut self) -> Result<()> {
        for slot in 0..self.slots.len() {
            if self.backlog.is_empty() {
                break;
            }
            if self.slot_running(slot) {
                continue;
            }
            self.launch_into(slot)?;
        }
        self.peak_running = self.peak_running.max(self.live_count());
        Ok(())
    }

    fn launch_into(&mut self, slot: usize) -> Result<()> {
        let Some((index, command)) = self.backlog.pop_front() else {
            return Ok(());
        };

        let spawned = ProcessHandle::spawn(
            &self.shell,
            &command,
            self.working_dir.as_deref(),
            self.config.kill_grace(),
        );
        match spawned {
            Ok(handle) => {
                debug!(
                    pool_id = %self.id,
                    slot,
                    index,
                    pid = handle.pid(),
                    command = %command.line,
                    "Launched command"
                );
                self.launched += 1;
                // the previous occupant has already finished; replacing it releases it
                self.slots[slot] = Some(Occupant {
                    index,
                    handle,
                    retired: false,
                });
                Ok(())
            }
            Err(e) => {
                self.spawn_failures += 1;
                error!(
                    pool_id = %self.id,
                    slot,
                    index,
                    command = %command.line,
                    error = %e,
                    "Failed to launch command"
                );
                match self.config.on_spawn_failure {
                    SpawnFailurePolicy::Skip => Ok(()),
                    SpawnFailurePolicy::Abort => Err(e),
                }
            }
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        // the slot drops that follow only wait out what is left of the grace
        for occupant in self.slots.iter_mut().flatten() {
            occupant.handle.request_termination();
        }
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("id", &self.id)
            .field("max_concurrency", &self.slots.len())
            .field("stats", &self.stats())
            .finish()
    }
}
