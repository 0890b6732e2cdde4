use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventFields = Map<String, Value>;

/// Append-only JSONL progress log for a session.
///
/// Each line is one compact JSON object. Default fields are `event`,
/// `session`, and `ts`; caller fields are merged last and may override them.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn append(&self, event: &str, fields: EventFields) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("event".to_string(), Value::String(event.to_string()));
        row.insert(
            "session".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        row.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        for (key, value) in fields {
            row.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn append_writes_one_compact_line_per_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-abc");

        let mut fields = EventFields::new();
        fields.insert("width".to_string(), json!(400));
        fields.insert("height".to_string(), json!(300));
        let written = log.append("image_loaded", fields)?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);

        let parsed: Value = serde_json::from_str(lines[0])?;
        assert_eq!(parsed, written);
        assert_eq!(parsed["event"], json!("image_loaded"));
        assert_eq!(parsed["session"], json!("session-abc"));
        assert_eq!(parsed["width"], json!(400));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn caller_fields_override_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = EventLog::new(temp.path().join("events.jsonl"), "session-abc");

        let mut fields = EventFields::new();
        fields.insert("session".to_string(), json!("other"));
        let written = log.append("image_loaded", fields)?;
        assert_eq!(written["session"], json!("other"));
        Ok(())
    }

    #[test]
    fn append_creates_missing_parent_directories() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("deep").join("events.jsonl");
        let log = EventLog::new(&path, "session-abc");
        log.append("session_started", EventFields::new())?;
        assert!(path.exists());
        Ok(())
    }
}
