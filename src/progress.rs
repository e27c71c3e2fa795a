use std::io::{self, Write};
use std::time::Instant;

/// Running progress line for batch commands, written to stderr so piped
/// output stays clean.
pub struct ConsoleProgress {
    enabled: bool,
    t0: Instant,
}

impl ConsoleProgress {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            t0: Instant::now(),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] {}", msg.as_ref());
    }

    pub fn progress(&self, label: &str, current: usize, total: usize, failed: usize) {
        if !self.enabled {
            return;
        }
        let total = total.max(1);
        let current = current.min(total);
        let pct = (current as f64 / total as f64) * 100.0;
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{ts}] {label} {current}/{total} ({pct:5.1}%) failed={failed}"
        );
    }

    /// Final line of a batch: totals, never per-document noise.
    pub fn summary(&self, label: &str, succeeded: usize, failed: usize) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{ts}] {label} done: ok={succeeded} failed={failed}"
        );
    }
}

fn fmt_elapsed(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::fmt_elapsed;

    #[test]
    fn elapsed_formats_minutes_and_hours() {
        assert_eq!(fmt_elapsed(0.0), "00:00");
        assert_eq!(fmt_elapsed(75.0), "01:15");
        assert_eq!(fmt_elapsed(3720.0), "01:02:00");
    }
}
