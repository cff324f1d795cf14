use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use switchboard_kernel::sha256_hex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only, hash-chained JSONL trail of every webhook decision.
pub(crate) struct AuditJsonl {
    file: Mutex<tokio::fs::File>,
    immutable_mirror: Option<Mutex<tokio::fs::File>>,
    sqlite: Option<Mutex<Connection>>,
    last_hash: Mutex<Option<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub audit_id: String,
    pub conversation_id: String,
    pub event_id: String,
    pub action: String,
    pub result: String,
    pub reason_code: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub(crate) fn new(
        conversation_id: &str,
        event_id: &str,
        action: &str,
        result: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            conversation_id: conversation_id.to_string(),
            event_id: event_id.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn seal(&mut self, prev_hash: Option<String>) -> Result<(), serde_json::Error> {
        self.prev_hash = prev_hash;
        self.record_hash.clear();
        let seed = serde_json::to_string(self)?;
        self.record_hash = sha256_hex(seed.as_bytes());
        Ok(())
    }
}

impl AuditJsonl {
    pub(crate) async fn new(
        path: &str,
        sqlite_path: Option<&str>,
        immutable_mirror_path: Option<&str>,
    ) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<AuditRecord>(line)
                    .ok()
                    .map(|rec| rec.record_hash)
            })
        });

        let file = open_append(path).await?;
        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(Mutex::new(open_append(path).await?)),
            _ => None,
        };

        let sqlite = match sqlite_path {
            Some(path) => {
                let conn = Connection::open(path).map_err(|e| e.to_string())?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS audit_records (
                        audit_id TEXT PRIMARY KEY,
                        conversation_id TEXT NOT NULL,
                        event_id TEXT NOT NULL,
                        action TEXT NOT NULL,
                        result TEXT NOT NULL,
                        reason_code TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        record_json TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| e.to_string())?;
                Some(Mutex::new(conn))
            }
            None => None,
        };

        Ok(Self {
            file: Mutex::new(file),
            immutable_mirror,
            sqlite,
            last_hash: Mutex::new(last_hash),
        })
    }

    /// Audit failures are logged and swallowed; they never fail a webhook.
    pub(crate) async fn append(&self, mut rec: AuditRecord) {
        // Held across the write so concurrent appends cannot fork the chain.
        let mut last_hash = self.last_hash.lock().await;
        let line = match rec
            .seal(last_hash.clone())
            .and_then(|_| serde_json::to_string(&rec))
        {
            Ok(line) => line,
            Err(e) => {
                warn!(event_name = "audit.encode_failed", error = %e, "audit record not written");
                return;
            }
        };

        {
            let mut file = self.file.lock().await;
            if let Err(e) = write_line(&mut file, &line).await {
                warn!(event_name = "audit.write_failed", error = %e, "audit record not written");
                return;
            }
        }
        *last_hash = Some(rec.record_hash.clone());
        drop(last_hash);

        if let Some(mirror) = &self.immutable_mirror {
            let mut mirror_file = mirror.lock().await;
            if let Err(e) = write_line(&mut mirror_file, &line).await {
                warn!(event_name = "audit.mirror_failed", error = %e, "audit mirror write failed");
            }
        }

        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite.lock().await;
            if let Err(e) = conn.execute(
                "
                INSERT OR REPLACE INTO audit_records
                (audit_id, conversation_id, event_id, action, result, reason_code, ts, record_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    rec.audit_id,
                    rec.conversation_id,
                    rec.event_id,
                    rec.action,
                    rec.result,
                    rec.reason_code,
                    rec.ts,
                    line
                ],
            ) {
                warn!(event_name = "audit.sqlite_failed", error = %e, "audit sqlite mirror failed");
            }
        }
    }
}

async fn open_append(path: &str) -> Result<tokio::fs::File, String> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| format!("open audit file {path} failed: {e}"))
}

async fn write_line(file: &mut tokio::fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

/// Re-hashes every record of an audit file and checks the `prev_hash` links.
pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut resealed = rec.clone();
        resealed
            .seal(rec.prev_hash.clone())
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        if rec.record_hash != resealed.record_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                resealed.record_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}
