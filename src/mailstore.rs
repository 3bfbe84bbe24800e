//! Mail access — the pipeline's inbound edge.
//!
//! The pipeline only needs a window of messages with attachment bytes on
//! disk; everything mailbox-specific sits behind [`MailStore`]. The shipped
//! implementation reads `.eml` files exported from the mailbox, with one
//! subdirectory per folder.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineOptions;
use crate::error::MailError;
use crate::pipeline::types::{AttachmentMeta, Message};

/// Source of messages for a run.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Fetch messages in the configured window, oldest first, with
    /// attachment bytes materialized to disk.
    async fn fetch(&self, options: &PipelineOptions) -> Result<Vec<Message>, MailError>;
}

/// `.eml` directory store.
///
/// Files directly under `dir` are treated as inbox; each subdirectory is a
/// folder whose name becomes `source_folder` ("sent items", "junk email").
pub struct EmlMailStore {
    dir: PathBuf,
    /// Where attachment bytes get written for the decoders.
    scratch_dir: PathBuf,
}

impl EmlMailStore {
    pub fn new(dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    fn parse_file(&self, path: &Path, folder: &str) -> Result<Message, MailError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let raw = std::fs::read(path)?;
        let parsed = MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| MailError::Parse {
                name: name.clone(),
                reason: "not a parseable RFC 822 message".into(),
            })?;

        let sender_email = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());
        let sender_name = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.name())
            .map(|s| s.to_string());
        let subject = parsed.subject().unwrap_or("(no subject)").to_string();
        let body = parsed
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default();
        let id = parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));
        let received_at = parsed
            .date()
            .and_then(|d| {
                Utc.with_ymd_and_hms(
                    d.year as i32,
                    u32::from(d.month),
                    u32::from(d.day),
                    u32::from(d.hour),
                    u32::from(d.minute),
                    u32::from(d.second),
                )
                .single()
            })
            .unwrap_or_else(Utc::now);

        let mut attachments = Vec::new();
        for part in parsed.attachments() {
            let Some(att_name) = part.attachment_name() else {
                continue;
            };
            let mut meta = AttachmentMeta::from_name(att_name, part.contents().len() as u64);
            meta.path = Some(self.materialize(&id, att_name, part.contents())?);
            attachments.push(meta);
        }

        Ok(Message {
            id,
            sender_email,
            sender_name,
            subject,
            body,
            received_at,
            source_folder: folder.to_string(),
            attachments,
        })
    }

    fn materialize(&self, msg_id: &str, name: &str, bytes: &[u8]) -> Result<PathBuf, MailError> {
        // Message ids carry characters unfit for paths; hash-free sanitise.
        let safe_id: String = msg_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let safe_name: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let dir = self.scratch_dir.join(&safe_id);
        std::fs::create_dir_all(&dir).map_err(|e| MailError::Attachment {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let path = dir.join(safe_name);
        std::fs::write(&path, bytes).map_err(|e| MailError::Attachment {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(path)
    }

    fn eml_files(&self) -> Result<Vec<(PathBuf, String)>, MailError> {
        if !self.dir.is_dir() {
            return Err(MailError::DirNotFound(self.dir.display().to_string()));
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                let folder = entry.file_name().to_string_lossy().to_lowercase();
                for sub in std::fs::read_dir(&path)? {
                    let sub = sub?.path();
                    if sub.extension().is_some_and(|e| e == "eml") {
                        files.push((sub, folder.clone()));
                    }
                }
            } else if path.extension().is_some_and(|e| e == "eml") {
                files.push((path, "inbox".to_string()));
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl MailStore for EmlMailStore {
    async fn fetch(&self, options: &PipelineOptions) -> Result<Vec<Message>, MailError> {
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::days(options.days_back);
        let mut messages = Vec::new();
        for (path, folder) in self.eml_files()? {
            let msg = match self.parse_file(&path, &folder) {
                Ok(m) => m,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unparseable message skipped");
                    continue;
                }
            };
            if msg.received_at < cutoff {
                debug!(id = %msg.id, "outside window, skipped");
                continue;
            }
            messages.push(msg);
        }
        messages.sort_by_key(|m| m.received_at);
        if let Some(max) = options.max_messages {
            messages.truncate(max);
        }
        info!(count = messages.len(), dir = %self.dir.display(), "messages fetched");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eml(from: &str, subject: &str, date: &str, body: &str) -> String {
        format!(
            "From: Reports <{from}>\r\nTo: me@corp.com\r\nSubject: {subject}\r\nDate: {date}\r\nMessage-ID: <{subject}@test>\r\nContent-Type: text/plain\r\n\r\n{body}\r\n"
        )
    }

    fn recent_date() -> String {
        Utc::now().format("%a, %d %b %Y %H:%M:%S +0000").to_string()
    }

    #[tokio::test]
    async fn fetches_and_parses_recent_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("a.eml"),
            eml("reports@acme.com", "daily", &recent_date(), "Revenue: $125,000"),
        )
        .expect("write");
        std::fs::write(
            dir.path().join("b.eml"),
            eml("x@y.com", "old", "Mon, 01 Jan 2001 00:00:00 +0000", "hello"),
        )
        .expect("write");

        let store = EmlMailStore::new(dir.path(), scratch.path());
        let msgs = store
            .fetch(&PipelineOptions::default())
            .await
            .expect("fetch");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].sender_email, "reports@acme.com");
        assert_eq!(msgs[0].sender_name.as_deref(), Some("Reports"));
        assert_eq!(msgs[0].source_folder, "inbox");
        assert!(msgs[0].body.contains("$125,000"));
    }

    #[tokio::test]
    async fn folder_subdirectories_set_source_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = tempfile::tempdir().expect("tempdir");
        let sent = dir.path().join("Sent Items");
        std::fs::create_dir(&sent).expect("mkdir");
        std::fs::write(
            sent.join("a.eml"),
            eml("me@corp.com", "fyi", &recent_date(), "numbers attached"),
        )
        .expect("write");

        let store = EmlMailStore::new(dir.path(), scratch.path());
        let msgs = store
            .fetch(&PipelineOptions::default())
            .await
            .expect("fetch");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].source_folder, "sent items");
    }

    #[tokio::test]
    async fn attachment_bytes_materialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = tempfile::tempdir().expect("tempdir");
        let raw = format!(
            "From: r@acme.com\r\nSubject: daily\r\nDate: {}\r\nMessage-ID: <att@test>\r\nMIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n--b\r\nContent-Type: text/csv; name=\"daily.csv\"\r\nContent-Disposition: attachment; filename=\"daily.csv\"\r\n\r\nMetric,Value\r\nRevenue,125000\r\n--b--\r\n",
            recent_date()
        );
        std::fs::write(dir.path().join("m.eml"), raw).expect("write");

        let store = EmlMailStore::new(dir.path(), scratch.path());
        let msgs = store
            .fetch(&PipelineOptions::default())
            .await
            .expect("fetch");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].attachments.len(), 1);
        let att = &msgs[0].attachments[0];
        assert_eq!(att.name, "daily.csv");
        assert_eq!(att.ext, ".csv");
        let path = att.path.as_ref().expect("materialized");
        let content = std::fs::read_to_string(path).expect("read");
        assert!(content.contains("Revenue,125000"));
    }

    #[tokio::test]
    async fn missing_dir_is_error() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let store = EmlMailStore::new("/nonexistent/mail", scratch.path());
        let err = store
            .fetch(&PipelineOptions::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, MailError::DirNotFound(_)));
    }
}
