use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Keeps diagnostic events in memory with timestamps.
///
/// Installed as a `tracing` layer so callers embedding discovery can show the
/// log of a run without scraping stderr. Clones share the same entries.
#[derive(Clone, Default)]
pub struct LogManager {
    entries: Arc<Mutex<Vec<String>>>,
}

impl LogManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry prefixed with a `[HH:MM:SS]` UTC timestamp.
    ///
    /// The layer calls this for every event it sees, with the message already
    /// formatted as `LEVEL :: message field=value`.
    ///
    /// # Parameters
    ///
    /// * `message` - The formatted event, without the timestamp
    ///
    /// # Example
    ///
    /// ```
    /// use cpu_topology::log_manager::LogManager;
    ///
    /// let log = LogManager::new();
    /// log.add_entry("INFO :: gathering driver=common".to_string());
    /// // Stored as "[12:34:56] INFO :: gathering driver=common"
    /// assert!(log.entries()[0].ends_with("gathering driver=common"));
    /// ```
    pub fn add_entry(&self, message: String) {
        let duration = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        let secs = duration.as_secs();
        let ts = format!(
            "[{:02}:{:02}:{:02}]",
            (secs % 86400) / 3600, // hours
            (secs % 3600) / 60,    // minutes
            secs % 60              // seconds
        );

        self.entries.lock().push(format!("{ts} {message}"));
    }

    /// Snapshot of the entries recorded so far, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Collects the message and the structured fields of one event.
#[derive(Default)]
struct EntryVisitor {
    message: String,
    fields: String,
}

impl Visit for EntryVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogManager {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);
        let level = event.metadata().level();
        self.add_entry(format!("{level} :: {}{}", visitor.message, visitor.fields));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn events_become_timestamped_entries() {
        let manager = LogManager::new();
        let subscriber = tracing_subscriber::registry().with(manager.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(driver = "intel", "gathering processor data");
            tracing::warn!("clock measurement skipped");
        });

        let entries = manager.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with('['));
        assert!(entries[0].ends_with("INFO :: gathering processor data driver=intel"));
        assert!(entries[1].contains("WARN :: clock measurement skipped"));
    }
}
