//! The audit log file

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::event::{AuditAction, AuditEvent};

/// Predicates for reading back events; all optional, all conjunctive
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tool_id: Option<String>,
    pub action: Option<AuditAction>,
    pub actor: Option<String>,
    /// Inclusive ISO-8601 lower bound
    pub since: Option<String>,
    /// Exclusive ISO-8601 upper bound
    pub until: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(tool_id) = &self.tool_id
            && event.tool_id.as_deref() != Some(tool_id)
        {
            return false;
        }
        if let Some(action) = self.action
            && event.action != action
        {
            return false;
        }
        if let Some(actor) = &self.actor
            && event.actor != *actor
        {
            return false;
        }
        // RFC 3339 timestamps in UTC compare correctly as strings
        if let Some(since) = &self.since
            && event.timestamp_iso < *since
        {
            return false;
        }
        if let Some(until) = &self.until
            && event.timestamp_iso >= *until
        {
            return false;
        }
        if let Some(success) = self.success
            && event.success != success
        {
            return false;
        }
        true
    }
}

/// Append-only JSONL audit log
pub struct AuditLog {
    path: PathBuf,
    archive_dir: PathBuf,
    /// Coarse lock around every file operation
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let archive_dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        Self {
            path,
            archive_dir,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one event; returns the event as written
    pub async fn append(&self, event: AuditEvent) -> eyre::Result<AuditEvent> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Complete newline-terminated record, written in one call
        let line = serde_json::to_string(&event)? + "\n";
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(action = %event.action, actor = %event.actor, "audit event appended");
        Ok(event)
    }

    /// Append, logging rather than propagating failures; audit problems
    /// must never poison foreground operations
    pub async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.append(event).await {
            warn!(error = %e, "audit append failed");
        }
    }

    /// Read events matching the filter, oldest first
    pub async fn read(&self, filter: &AuditFilter) -> eyre::Result<Vec<AuditEvent>> {
        let _guard = self.write_lock.lock().await;
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events: Vec<AuditEvent> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|e| filter.matches(e))
            .collect();

        if let Some(limit) = filter.limit
            && events.len() > limit
        {
            // Keep the most recent `limit` events
            events.drain(..events.len() - limit);
        }
        Ok(events)
    }

    /// Move events older than the cutoff to a dated sibling file
    ///
    /// Returns how many events were archived. The live file is rewritten
    /// via temp + rename so a crash mid-archive never loses records.
    pub async fn archive(&self, before_iso: &str) -> eyre::Result<usize> {
        let _guard = self.write_lock.lock().await;
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut old_lines = Vec::new();
        let mut keep_lines = Vec::new();
        for line in content.lines() {
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) if event.timestamp_iso.as_str() < before_iso => old_lines.push(line),
                _ => keep_lines.push(line),
            }
        }

        if old_lines.is_empty() {
            return Ok(0);
        }

        let date = before_iso.split('T').next().unwrap_or(before_iso);
        let archive_path = self.archive_dir.join(format!("audit-{}.log.jsonl", date));
        let mut archive = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&archive_path)
            .await?;
        archive.write_all((old_lines.join("\n") + "\n").as_bytes()).await?;
        archive.flush().await?;

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut remaining = keep_lines.join("\n");
        if !remaining.is_empty() {
            remaining.push('\n');
        }
        fs::write(&tmp, remaining).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!(archived = old_lines.len(), path = %archive_path.display(), "audit archive");
        Ok(old_lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn log_in(dir: &std::path::Path) -> AuditLog {
        AuditLog::new(dir.join("audit.log.jsonl"))
    }

    #[tokio::test]
    async fn test_append_read_round_trip() {
        let temp = tempdir().unwrap();
        let log = log_in(temp.path());

        let written = log
            .append(
                AuditEvent::new(AuditAction::SubagentStart, "inst-1")
                    .with_tool("run-1", "subagent_run")
                    .with_details(serde_json::json!({"k": "v"})),
            )
            .await
            .unwrap();

        let events = log.read(&AuditFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, written.id);
        assert_eq!(events[0].details["k"], "v");
    }

    #[tokio::test]
    async fn test_read_missing_file_is_empty() {
        let temp = tempdir().unwrap();
        let log = log_in(temp.path());
        assert!(log.read(&AuditFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filters() {
        let temp = tempdir().unwrap();
        let log = log_in(temp.path());

        log.append(AuditEvent::new(AuditAction::SubagentStart, "inst-1").with_tool("r1", "subagent_run"))
            .await
            .unwrap();
        log.append(AuditEvent::new(AuditAction::SubagentFailure, "inst-1").failed("timeout"))
            .await
            .unwrap();
        log.append(AuditEvent::new(AuditAction::TeamStart, "inst-2").with_tool("r2", "agent_team_run"))
            .await
            .unwrap();

        let by_action = log
            .read(&AuditFilter {
                action: Some(AuditAction::TeamStart),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_action.len(), 1);

        let by_actor = log
            .read(&AuditFilter {
                actor: Some("inst-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_actor.len(), 2);

        let failures = log
            .read(&AuditFilter {
                success: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_message.as_deref(), Some("timeout"));

        let by_tool = log
            .read(&AuditFilter {
                tool_id: Some("r2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_tool.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_keeps_most_recent() {
        let temp = tempdir().unwrap();
        let log = log_in(temp.path());

        for i in 0..5 {
            log.append(
                AuditEvent::new(AuditAction::ReservationGranted, "inst-1")
                    .with_details(serde_json::json!({"n": i})),
            )
            .await
            .unwrap();
        }

        let events = log
            .read(&AuditFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].details["n"], 3);
        assert_eq!(events[1].details["n"], 4);
    }

    #[tokio::test]
    async fn test_time_bounds() {
        let temp = tempdir().unwrap();
        let log = log_in(temp.path());

        let mut early = AuditEvent::new(AuditAction::TeamStart, "inst-1");
        early.timestamp_iso = "2026-01-01T00:00:00.000Z".to_string();
        let mut late = AuditEvent::new(AuditAction::TeamComplete, "inst-1");
        late.timestamp_iso = "2026-06-01T00:00:00.000Z".to_string();

        log.append(early).await.unwrap();
        log.append(late).await.unwrap();

        let events = log
            .read(&AuditFilter {
                since: Some("2026-03-01T00:00:00.000Z".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::TeamComplete);

        let events = log
            .read(&AuditFilter {
                until: Some("2026-03-01T00:00:00.000Z".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::TeamStart);
    }

    #[tokio::test]
    async fn test_torn_final_line_is_skipped() {
        let temp = tempdir().unwrap();
        let log = log_in(temp.path());

        log.append(AuditEvent::new(AuditAction::TeamStart, "inst-1")).await.unwrap();

        // Simulate a crash mid-append
        let mut content = std::fs::read_to_string(temp.path().join("audit.log.jsonl")).unwrap();
        content.push_str("{\"id\":\"trunc");
        std::fs::write(temp.path().join("audit.log.jsonl"), content).unwrap();

        let events = log.read(&AuditFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_archive_moves_old_events() {
        let temp = tempdir().unwrap();
        let log = log_in(temp.path());

        let mut old = AuditEvent::new(AuditAction::TeamStart, "inst-1");
        old.timestamp_iso = "2026-01-01T00:00:00.000Z".to_string();
        let mut fresh = AuditEvent::new(AuditAction::TeamComplete, "inst-1");
        fresh.timestamp_iso = "2026-06-01T00:00:00.000Z".to_string();

        log.append(old).await.unwrap();
        log.append(fresh).await.unwrap();

        let archived = log.archive("2026-03-01T00:00:00.000Z").await.unwrap();
        assert_eq!(archived, 1);

        let remaining = log.read(&AuditFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].action, AuditAction::TeamComplete);

        let archive_path = temp.path().join("audit-2026-03-01.log.jsonl");
        assert!(archive_path.exists());
        let archived_content = std::fs::read_to_string(archive_path).unwrap();
        assert!(archived_content.contains("team_start"));
    }

    #[tokio::test]
    async fn test_archive_nothing_old() {
        let temp = tempdir().unwrap();
        let log = log_in(temp.path());

        log.append(AuditEvent::new(AuditAction::TeamStart, "inst-1")).await.unwrap();
        let archived = log.archive("2000-01-01T00:00:00.000Z").await.unwrap();
        assert_eq!(archived, 0);
        assert_eq!(log.read(&AuditFilter::default()).await.unwrap().len(), 1);
    }
}
