/// Daemon log sink: every line goes to stdout and is appended to the log
/// file so the message survives when the service manager drops stdout.
///
/// Line format: `[HotPlug] 2024-01-01 12:00:00 t+42.0s pid=123 | message`
/// The `t+` offset is monotonic seconds since daemon start, which makes
/// debounce timing readable even when the wall clock jumps.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

pub struct Logger {
    start: Instant,
    log_file: PathBuf,
}

impl Logger {
    pub fn new(log_file: PathBuf) -> Self {
        Self {
            start: Instant::now(),
            log_file,
        }
    }

    /// Formats one log line without emitting it.
    pub fn format_line(&self, msg: &str) -> String {
        format!(
            "[HotPlug] {} t+{:.1}s pid={} | {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.start.elapsed().as_secs_f64(),
            std::process::id(),
            msg
        )
    }

    /// Emits `msg` to stdout and appends it to the log file. A log-file
    /// write failure is ignored: logging must never take the daemon down.
    pub fn log(&self, msg: &str) {
        let line = self.format_line(msg);
        println!("{line}");
        if let Ok(mut f) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
        {
            let _ = writeln!(f, "{line}");
        }
    }
}
