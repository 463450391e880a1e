/// Single seam for every external OS command the daemon issues (amixer,
/// alsactl, systemctl, modprobe, tvservice). Components take
/// `&dyn CommandRunner` so tests can script outcomes, including timeouts
/// and missing binaries, without touching the host system.
use std::io::{ErrorKind, Read};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

#[derive(Debug, PartialEq, Eq)]
pub enum CmdError {
    /// The command did not finish within its timeout and was killed.
    Timeout,
    /// The binary does not exist on this image.
    NotFound,
    /// Spawn/wait failure, or (for `capture`) a non-zero exit.
    Failed(String),
}

impl std::fmt::Display for CmdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CmdError::Timeout => write!(f, "timed out"),
            CmdError::NotFound => write!(f, "not found"),
            CmdError::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

pub type CmdResult<T> = Result<T, CmdError>;

pub trait CommandRunner {
    /// Runs `argv` with output discarded; returns the exit code.
    fn run(&self, argv: &[&str], timeout: Duration) -> CmdResult<i32>;

    /// Runs `argv` capturing stdout; `Ok` only on a zero exit.
    fn capture(&self, argv: &[&str], timeout: Duration) -> CmdResult<String>;
}

/// Real implementation backed by `std::process`. Commands are polled with
/// `try_wait` so a hung binary is killed at the deadline instead of
/// stalling the control loop forever.
pub struct SystemRunner;

const WAIT_SLICE: Duration = Duration::from_millis(25);

impl SystemRunner {
    fn spawn(&self, argv: &[&str], piped_stdout: bool) -> CmdResult<std::process::Child> {
        let (prog, args) = argv
            .split_first()
            .ok_or_else(|| CmdError::Failed("empty argv".to_string()))?;
        let stdout = if piped_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        Command::new(prog)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    CmdError::NotFound
                } else {
                    CmdError::Failed(e.to_string())
                }
            })
    }

    fn wait(&self, child: &mut std::process::Child, timeout: Duration) -> CmdResult<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status.code().unwrap_or(-1)),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(CmdError::Timeout);
                    }
                    std::thread::sleep(WAIT_SLICE);
                }
                Err(e) => return Err(CmdError::Failed(e.to_string())),
            }
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[&str], timeout: Duration) -> CmdResult<i32> {
        let mut child = self.spawn(argv, false)?;
        self.wait(&mut child, timeout)
    }

    fn capture(&self, argv: &[&str], timeout: Duration) -> CmdResult<String> {
        let mut child = self.spawn(argv, true)?;
        // The commands we capture (amixer cget, pid queries) emit well under
        // the pipe buffer size, so reading after exit cannot deadlock.
        let code = self.wait(&mut child, timeout)?;
        let mut out = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            let _ = stdout.read_to_string(&mut out);
        }
        if code != 0 {
            return Err(CmdError::Failed(format!("exit status {code}")));
        }
        Ok(out)
    }
}
