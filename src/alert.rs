use std::time::{Duration, Instant};

pub const ALERT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Delivery side of the alert channel (chat webhook, mail bridge). External.
pub trait Notifier: Send {
    fn notify(&self, message: &str) -> anyhow::Result<()>;
}

/// Buffers alert messages and emits at most one notification per window.
/// Buffered lines flush when a send arrives after the window has elapsed, or
/// on explicit `flush`. A failed delivery keeps the buffer for the next try.
pub struct ThrottledAlerts {
    notifier: Box<dyn Notifier>,
    window: Duration,
    buffered: Vec<String>,
    last_sent: Option<Instant>,
}

impl ThrottledAlerts {
    #[must_use]
    pub fn new(notifier: Box<dyn Notifier>) -> Self {
        Self::with_window(notifier, ALERT_WINDOW)
    }

    #[must_use]
    pub fn with_window(notifier: Box<dyn Notifier>, window: Duration) -> Self {
        Self {
            notifier,
            window,
            buffered: Vec::new(),
            last_sent: None,
        }
    }

    pub fn send(&mut self, message: impl Into<String>) {
        self.buffered.push(message.into());
        let due = match self.last_sent {
            None => true,
            Some(at) => at.elapsed() >= self.window,
        };
        if due {
            self.deliver();
        }
    }

    pub fn flush(&mut self) {
        if !self.buffered.is_empty() {
            self.deliver();
        }
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    fn deliver(&mut self) {
        let message = self.buffered.join("\n");
        match self.notifier.notify(&message) {
            Ok(()) => {
                self.buffered.clear();
                self.last_sent = Some(Instant::now());
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "alert delivery failed, keeping buffer");
            }
        }
    }
}
