//! A single spawned command and the shell it runs under.

use chrono::{DateTime, Utc};
use pagemill_core::{Command, CommandOutcome, PagemillError, ProcessStatus, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, warn};

/// The interpreter every command line is handed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    pub program: PathBuf,
    pub flag: &'static str,
}

impl Shell {
    /// Resolve `name` (or the platform default) on `PATH`.
    pub fn resolve(name: Option<&str>) -> Result<Self> {
        let default = if cfg!(windows) { "cmd" } else { "sh" };
        let name = name.unwrap_or(default);
        let program = which::which(name).map_err(|e| {
            PagemillError::InvalidConfiguration(format!("shell `{}` not found: {}", name, e))
        })?;
        let is_cmd = program
            .file_stem()
            .map(|stem| stem.eq_ignore_ascii_case("cmd"))
            .unwrap_or(false);
        Ok(Self {
            program,
            flag: if is_cmd { "/C" } else { "-c" },
        })
    }
}

/// Fail unless `dir` exists and is a directory.
pub(crate) fn ensure_directory(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(PagemillError::InvalidWorkingDirectory(dir.to_path_buf()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

/// One running (or finished) child process.
///
/// stdin and stdout are piped and owned by the handle; stderr is inherited so
/// command errors reach the terminal immediately. On Unix the child leads its
/// own process group, so termination also reaches pipelines and subshells.
///
/// Dropping a handle whose process is still alive sends SIGTERM to the group,
/// waits up to the kill grace, escalates to SIGKILL and reaps the child. A
/// stopped child gets SIGKILL straight away. The wait blocks the current
/// thread; owners of several handles should call `request_termination` on all
/// of them first so the grace periods overlap.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    line: String,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    exit: Option<ProcessStatus>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    kill_grace: Duration,
    term_deadline: Option<Instant>,
}

impl ProcessHandle {
    /// Launch `command` under `shell`. A relative command directory is taken
    /// relative to `base_dir`; with no command directory `base_dir` is used.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        shell: &Shell,
        command: &Command,
        base_dir: Option<&Path>,
        kill_grace: Duration,
    ) -> Result<Self> {
        if command.line.trim().is_empty() {
            return Err(PagemillError::SpawnFailure {
                command: command.line.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
            });
        }

        let dir = effective_dir(command.working_dir.as_deref(), base_dir);
        if let Some(dir) = &dir {
            ensure_directory(dir)?;
        }

        let mut cmd = tokio::process::Command::new(&shell.program);
        cmd.arg(shell.flag)
            .arg(&command.line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| PagemillError::SpawnFailure {
            command: command.line.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| PagemillError::SpawnFailure {
            command: command.line.clone(),
            source: io::Error::new(io::ErrorKind::Other, "child was reaped before its pid was read"),
        })?;

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            pid,
            line: command.line.clone(),
            exit: None,
            started_at: Utc::now(),
            finished_at: None,
            kill_grace,
            term_deadline: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.line
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Query the OS for the current state without blocking. The first
    /// terminal status observed is kept, so a finished handle stays finished.
    /// A stopped child counts as finished; it is killed when the handle goes.
    pub fn status(&mut self) -> ProcessStatus {
        if let Some(status) = self.exit {
            return status;
        }
        match self.child.try_wait() {
            Ok(Some(exit)) => self.record_exit(ProcessStatus::from(exit)),
            Ok(None) => self.poll_stopped(),
            Err(e) => {
                // The child can no longer be queried; treat it as gone rather
                // than letting it hold a slot forever.
                warn!(pid = self.pid, error = %e, "Failed to query process state");
                self.record_exit(ProcessStatus::default())
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.status().running
    }

    /// Only meaningful once [`is_running`](Self::is_running) is false
    pub fn was_signaled(&mut self) -> bool {
        self.status().signaled
    }

    /// Only meaningful once [`is_running`](Self::is_running) is false
    pub fn was_stopped(&mut self) -> bool {
        self.status().stopped
    }

    /// Only meaningful once [`is_running`](Self::is_running) is false
    pub fn exit_code(&mut self) -> Option<i32> {
        self.status().exit_code
    }

    /// Read up to `max_bytes` from the child's stdout. An empty buffer means
    /// end of stream.
    pub async fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(Vec::new());
        };
        let mut buf = vec![0u8; max_bytes];
        let n = stdout.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write all of `data` to the child's stdin.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let pid = self.pid;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(PagemillError::BrokenPipe { pid })?;
        let result = async {
            stdin.write_all(data).await?;
            stdin.flush().await
        }
        .await;
        result.map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe => PagemillError::BrokenPipe { pid },
            _ => PagemillError::IoError(e),
        })
    }

    /// Close stdin so the child sees end of input.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Terminate the process if it is still running and wait for it to be
    /// reaped. Returns the final status.
    pub async fn close(mut self) -> ProcessStatus {
        self.stdin.take();
        self.stdout.take();
        let status = self.status();
        if !self.needs_termination() {
            return status;
        }

        debug!(pid = self.pid, stopped = status.stopped, "Terminating process");
        self.request_termination();
        if !self.needs_termination() {
            return self.status();
        }
        let grace = self.termination_remaining();
        let exit = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(pid = self.pid, "Process ignored SIGTERM, killing");
                self.signal(Termination::Forced);
                self.child.wait().await
            }
        };
        match exit {
            Ok(exit) => self.record_exit(ProcessStatus::from(exit)),
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to reap process");
                self.record_exit(ProcessStatus::default())
            }
        }
    }

    /// Build an outcome record. Uses the current time as the finish time if
    /// the process has not been observed to finish.
    pub fn outcome(&mut self, index: usize) -> CommandOutcome {
        let status = self.status();
        CommandOutcome {
            index,
            command: self.line.clone(),
            pid: self.pid,
            status,
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
        }
    }

    /// Send the first termination signal without waiting for the child.
    /// Later `close` or drop only wait out what is left of the kill grace.
    pub(crate) fn request_termination(&mut self) {
        self.status();
        if self.term_deadline.is_some() || !self.needs_termination() {
            return;
        }
        // SIGTERM stays pending on a stopped process
        let stopped = self.exit.map_or(false, |s| s.stopped);
        if stopped {
            self.signal(Termination::Forced);
        } else {
            self.signal(Termination::Graceful);
        }
        self.term_deadline = Some(Instant::now() + self.kill_grace);
    }

    /// True while the child still has to be signalled and reaped
    fn needs_termination(&self) -> bool {
        self.exit.map_or(true, |s| s.stopped)
    }

    fn termination_remaining(&self) -> Duration {
        self.term_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(self.kill_grace)
    }

    /// `try_wait` never reports job-control stops, so ask with WUNTRACED.
    #[cfg(unix)]
    fn poll_stopped(&mut self) -> ProcessStatus {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid;

        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED;
        match waitpid(Pid::from_raw(self.pid as i32), Some(flags)) {
            Ok(WaitStatus::Stopped(_, signal)) => self.record_exit(ProcessStatus {
                stopped: true,
                signal: Some(signal as i32),
                ..ProcessStatus::default()
            }),
            // exited after try_wait looked; this call reaped it
            Ok(WaitStatus::Exited(_, code)) => self.record_exit(ProcessStatus {
                exited: true,
                exit_code: Some(code),
                ..ProcessStatus::default()
            }),
            Ok(WaitStatus::Signaled(_, signal, _)) => self.record_exit(ProcessStatus {
                signaled: true,
                signal: Some(signal as i32),
                ..ProcessStatus::default()
            }),
            Ok(_) => ProcessStatus::running(),
            Err(e) => {
                debug!(pid = self.pid, error = %e, "waitpid failed");
                ProcessStatus::running()
            }
        }
    }

    #[cfg(not(unix))]
    fn poll_stopped(&mut self) -> ProcessStatus {
        ProcessStatus::running()
    }

    fn record_exit(&mut self, status: ProcessStatus) -> ProcessStatus {
        self.exit = Some(status);
        self.finished_at = Some(Utc::now());
        status
    }

    #[cfg(unix)]
    fn signal(&mut self, termination: Termination) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let signal = match termination {
            Termination::Graceful => Signal::SIGTERM,
            Termination::Forced => Signal::SIGKILL,
        };
        if let Err(e) = killpg(Pid::from_raw(self.pid as i32), signal) {
            debug!(pid = self.pid, error = %e, "killpg failed, signalling child directly");
            let _ = self.child.start_kill();
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _termination: Termination) {
        let _ = self.child.start_kill();
    }

    fn try_reap_within(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) | Err(_) => return true,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Ok(None) => return false,
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stdin.take();
        self.stdout.take();
        self.request_termination();
        if !self.needs_termination() {
            return;
        }

        debug!(pid = self.pid, command = %self.line, "Terminating process on drop");
        if self.try_reap_within(self.termination_remaining()) {
            return;
        }
        self.signal(Termination::Forced);
        if !self.try_reap_within(Duration::from_secs(1)) {
            warn!(pid = self.pid, "Process survived SIGKILL, leaving it to the runtime reaper");
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.line)
            .field("exit", &self.exit)
            .finish()
    }
}

fn effective_dir(command_dir: Option<&Path>, base_dir: Option<&Path>) -> Option<PathBuf> {
    match (command_dir, base_dir) {
        (Some(dir), Some(base)) if dir.is_relative() => Some(base.join(dir)),
        (Some(dir), _) => Some(dir.to_path_buf()),
        (None, base) => base.map(Path::to_path_buf),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh() -> Shell {
        Shell::resolve(None).unwrap()
    }

    fn spawn(line: &str) -> ProcessHandle {
        ProcessHandle::spawn(&sh(), &Command::new(line), None, Duration::from_millis(200)).unwrap()
    }

    async fn finish(handle: &mut ProcessHandle) {
        while handle.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn process_exists(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[test]
    fn test_shell_resolves_sh() {
        let shell = sh();
        assert_eq!(shell.flag, "-c");
        assert!(shell.program.is_absolute());
    }

    #[test]
    fn test_shell_missing_program() {
        let err = Shell::resolve(Some("definitely-not-a-shell-pagemill")).unwrap_err();
        assert!(matches!(err, PagemillError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_effective_dir() {
        let base = Path::new("/data");
        assert_eq!(effective_dir(None, None), None);
        assert_eq!(effective_dir(None, Some(base)), Some(PathBuf::from("/data")));
        assert_eq!(
            effective_dir(Some(Path::new("out")), Some(base)),
            Some(PathBuf::from("/data/out"))
        );
        assert_eq!(
            effective_dir(Some(Path::new("/tmp")), Some(base)),
            Some(PathBuf::from("/tmp"))
        );
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let mut handle = spawn("exit 7");
        finish(&mut handle).await;
        assert_eq!(handle.exit_code(), Some(7));
        assert!(!handle.was_signaled());
        assert!(!handle.was_stopped());
        // stays finished
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_signaled_process() {
        let mut handle = spawn("kill -9 $$");
        finish(&mut handle).await;
        assert!(handle.was_signaled());
        assert_eq!(handle.exit_code(), None);
        assert_eq!(handle.status().signal, Some(9));
    }

    #[tokio::test]
    async fn test_read_stdout() {
        let mut handle = spawn("printf hello");
        let mut out = Vec::new();
        loop {
            let chunk = handle.read(2).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 2);
            out.extend(chunk);
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let mut handle = spawn("cat");
        handle.write(b"page 1\n").await.unwrap();
        handle.close_stdin();
        let chunk = handle.read(64).await.unwrap();
        assert_eq!(chunk, b"page 1\n");
        finish(&mut handle).await;
        assert_eq!(handle.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_write_after_exit_is_broken_pipe() {
        let mut handle = spawn("exec 0<&-; exit 0");
        finish(&mut handle).await;
        let err = handle.write(&[b'x'; 1 << 16]).await.unwrap_err();
        assert!(matches!(err, PagemillError::BrokenPipe { .. }));
    }

    #[tokio::test]
    async fn test_write_after_close_stdin_is_broken_pipe() {
        let mut handle = spawn("sleep 0.1");
        handle.close_stdin();
        let err = handle.write(b"x").await.unwrap_err();
        assert!(matches!(err, PagemillError::BrokenPipe { .. }));
    }

    #[tokio::test]
    async fn test_invalid_working_directory() {
        let cmd = Command::new("true").with_working_dir("/definitely/not/here");
        let err = ProcessHandle::spawn(&sh(), &cmd, None, Duration::ZERO).unwrap_err();
        assert!(matches!(err, PagemillError::InvalidWorkingDirectory(_)));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let err = ProcessHandle::spawn(&sh(), &Command::new("  "), None, Duration::ZERO).unwrap_err();
        assert!(matches!(err, PagemillError::SpawnFailure { .. }));
    }

    #[tokio::test]
    async fn test_working_directory_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = ProcessHandle::spawn(
            &sh(),
            &Command::new("pwd -P"),
            Some(dir.path()),
            Duration::ZERO,
        )
        .unwrap();
        let out = handle.read(4096).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), expected.to_string_lossy());
    }

    #[tokio::test]
    async fn test_close_terminates_running_process() {
        let handle = spawn("sleep 30");
        let pid = handle.pid();
        let status = handle.close().await;
        assert!(!status.running);
        assert!(status.signaled);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_drop_terminates_and_reaps() {
        let handle = spawn("sleep 30");
        let pid = handle.pid();
        assert!(process_exists(pid));
        drop(handle);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_stopped_process_is_not_running() {
        let mut handle = spawn("kill -STOP $$");
        let pid = handle.pid();
        tokio::time::timeout(Duration::from_secs(5), finish(&mut handle))
            .await
            .unwrap();
        assert!(handle.was_stopped());
        assert!(!handle.was_signaled());
        assert_eq!(handle.exit_code(), None);
        assert_eq!(
            handle.status().signal,
            Some(nix::sys::signal::Signal::SIGSTOP as i32)
        );
        // stays stopped, not resurrected as running
        assert!(!handle.is_running());
        assert!(process_exists(pid));

        drop(handle);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_close_kills_stopped_process() {
        let mut handle = spawn("kill -STOP $$");
        let pid = handle.pid();
        tokio::time::timeout(Duration::from_secs(5), finish(&mut handle))
            .await
            .unwrap();
        assert!(handle.was_stopped());

        let status = handle.close().await;
        assert!(status.signaled);
        assert_eq!(status.signal, Some(9));
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_termination_request_shares_grace() {
        let mut handle = ProcessHandle::spawn(
            &sh(),
            &Command::new("trap '' TERM; sleep 30"),
            None,
            Duration::from_millis(300),
        )
        .unwrap();
        let pid = handle.pid();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.request_termination();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_running());

        let started = Instant::now();
        drop(handle);
        // only the rest of the grace is waited out
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_outcome_records_command() {
        let mut handle = spawn("exit 2");
        assert_eq!(handle.command_line(), "exit 2");
        finish(&mut handle).await;
        let outcome = handle.outcome(5);
        assert_eq!(outcome.index, 5);
        assert_eq!(outcome.command, "exit 2");
        assert_eq!(outcome.status.exit_code, Some(2));
        assert!(outcome.finished_at >= outcome.started_at);
    }
}
