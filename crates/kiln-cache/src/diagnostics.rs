use crate::perms::private_open_options;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DIAGNOSTICS_LOG_FILENAME: &str = "cache-error.log";

/// Append-only failure log kept next to the shard tree.
///
/// Every write is best effort: if the log itself cannot be written the message
/// still goes to `tracing`, and the calling operation is never affected.
#[derive(Clone, Debug)]
pub struct DiagnosticsLog {
    path: PathBuf,
}

impl DiagnosticsLog {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(DIAGNOSTICS_LOG_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, message: std::fmt::Arguments<'_>) {
        tracing::warn!(target: "kiln.cache", log = %self.path.display(), "{message}");

        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "<unknown>".to_owned());
        let line = format!("[{timestamp}] {message}\n");

        let result = private_open_options()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = result {
            tracing::debug!(
                target: "kiln.cache",
                path = %self.path.display(),
                error = %err,
                "failed to append to cache diagnostics log"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_timestamped_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log = DiagnosticsLog::new(tmp.path());

        log.record(format_args!("first failure"));
        log.record(format_args!("second failure: {}", 42));

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['), "{}", lines[0]);
        assert!(lines[0].ends_with("] first failure"), "{}", lines[0]);
        assert!(lines[1].ends_with("] second failure: 42"), "{}", lines[1]);
    }

    #[test]
    fn unwritable_log_is_swallowed() {
        let tmp = tempfile::tempdir().unwrap();
        // The log's parent directory does not exist, so every append fails.
        let log = DiagnosticsLog::new(&tmp.path().join("missing").join("root"));
        log.record(format_args!("nobody will see this"));
        assert!(!log.path().exists());
    }
}
