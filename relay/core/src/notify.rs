//! Completion Notifications
//!
//! The engine tells the host application when a generation finishes while
//! the application is in the background. How that is shown (desktop
//! notification, terminal bell, nothing) is up to the host.

/// Host notification hook
pub trait Notifier: Send + Sync {
    /// Show a notification
    fn show(&self, title: &str, body: &str);

    /// Whether the application is in the foreground
    ///
    /// Notifications are only shown when this returns false.
    fn is_foreground(&self) -> bool {
        true
    }
}

/// Never notifies
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn show(&self, _title: &str, _body: &str) {}
}

/// Writes notifications to the log; always considered in the background
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, title: &str, body: &str) {
        tracing::info!(title, body, "Notification");
    }

    fn is_foreground(&self) -> bool {
        false
    }
}

/// Notification body: the first line of `content`, shortened
pub fn snippet(content: &str, max_chars: usize) -> String {
    let line = content.trim().lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut short: String = line.chars().take(max_chars).collect();
    short.push('…');
    short
}
