use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::escape::join_argv;

/// A single shell invocation waiting in a pool backlog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub line: String,
    pub working_dir: Option<PathBuf>,
}

impl Command {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            working_dir: None,
        }
    }

    /// Build a command line from an argument vector, quoting every element
    /// so the shell sees each one as a single literal word.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(join_argv(argv))
    }

    pub fn with_working_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        Command::new(line)
    }
}

impl From<String> for Command {
    fn from(line: String) -> Self {
        Command::new(line)
    }
}

/// Snapshot of a child process state, taken on demand
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessStatus {
    pub running: bool,
    pub exited: bool,
    pub signaled: bool,
    pub stopped: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessStatus {
    pub fn running() -> Self {
        Self {
            running: true,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exited && self.exit_code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessStatus {
    #[cfg(unix)]
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        let stopped_signal = status.stopped_signal();
        Self {
            running: false,
            exited: status.code().is_some(),
            signaled: status.signal().is_some(),
            stopped: stopped_signal.is_some(),
            exit_code: status.code(),
            signal: status.signal().or(stopped_signal),
        }
    }

    #[cfg(not(unix))]
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            running: false,
            exited: true,
            exit_code: status.code(),
            ..Default::default()
        }
    }
}

/// Result of one finished command, recorded only when a pool collects outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub index: usize,
    pub command: String,
    pub pid: u32,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CommandOutcome {
    pub fn duration_ms(&self) -> u64 {
        self.finished_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Counters describing a pool's progress through its backlog
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStats {
    pub launched: usize,
    pub finished: usize,
    pub running: usize,
    pub pending: usize,
    pub spawn_failures: usize,
    pub cancelled: usize,
    pub peak_running: usize,
}

impl PoolStats {
    /// Every command the pool has been given, whatever state it is in
    pub fn total(&self) -> usize {
        self.finished + self.running + self.pending + self.spawn_failures + self.cancelled
    }
}

/// A declarative list of stages run through one pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub name: String,
    pub dir: Option<PathBuf>,
    pub stages: Vec<Stage>,
}

/// One stage of a batch. When `wait` is false the next stage is queued into
/// the pool as soon as this one has been launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub name: String,
    pub dir: Option<PathBuf>,
    pub commands: Vec<String>,
    pub wait: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: None,
            commands: Vec::new(),
            wait: true,
        }
    }

    pub fn with_command(mut self, line: impl Into<String>) -> Self {
        self.commands.push(line.into());
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Commands for this stage, carrying the stage directory if one is set
    pub fn to_commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .map(|line| {
                let cmd = Command::new(line.as_str());
                match &self.dir {
                    Some(dir) => cmd.with_working_dir(dir),
                    None => cmd,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_new() {
        let cmd = Command::new("echo hello");
        assert_eq!(cmd.line, "echo hello");
        assert!(cmd.working_dir.is_none());
    }

    #[test]
    fn test_command_with_working_dir() {
        let cmd = Command::from("ls").with_working_dir("/tmp");
        assert_eq!(cmd.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_from_argv_quotes_arguments() {
        let cmd = Command::from_argv(["convert", "my scan.png", "-trim", "it's.png"]);
        assert_eq!(cmd.line, r#"convert 'my scan.png' -trim 'it'\''s.png'"#);
    }

    #[test]
    fn test_outcome_duration() {
        let started_at = Utc::now();
        let outcome = CommandOutcome {
            index: 0,
            command: "sleep 1".to_string(),
            pid: 42,
            status: ProcessStatus::default(),
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(1250),
        };
        assert_eq!(outcome.duration_ms(), 1250);

        // clock skew never yields a negative duration
        let skewed = CommandOutcome {
            finished_at: started_at - chrono::Duration::milliseconds(5),
            ..outcome
        };
        assert_eq!(skewed.duration_ms(), 0);
    }

    #[test]
    fn test_process_status_running() {
        let status = ProcessStatus::running();
        assert!(status.running);
        assert!(!status.exited);
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_status_from_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        let ok = ProcessStatus::from(std::process::ExitStatus::from_raw(0));
        assert!(ok.success());
        assert!(!ok.running);

        // wait(2) encoding: exit code lives in the high byte
        let failed = ProcessStatus::from(std::process::ExitStatus::from_raw(3 << 8));
        assert!(failed.exited);
        assert_eq!(failed.exit_code, Some(3));
        assert!(!failed.success());

        let killed = ProcessStatus::from(std::process::ExitStatus::from_raw(9));
        assert!(killed.signaled);
        assert!(!killed.exited);
        assert_eq!(killed.signal, Some(9));
    }

    #[test]
    fn test_pool_stats_total() {
        let stats = PoolStats {
            launched: 4,
            finished: 2,
            running: 2,
            pending: 3,
            spawn_failures: 1,
            cancelled: 1,
            peak_running: 2,
        };
        assert_eq!(stats.total(), 9);
    }

    #[test]
    fn test_stage_to_commands_carries_dir() {
        let mut stage = Stage::new("trim")
            .with_command("convert a.png -trim a.png")
            .with_command("convert b.png -trim b.png");
        stage.dir = Some(PathBuf::from("out"));

        let commands = stage.to_commands();
        assert_eq!(commands.len(), 2);
        assert!(stage.wait);
        assert!(commands
            .iter()
            .all(|c| c.working_dir == Some(PathBuf::from("out"))));
    }
}
