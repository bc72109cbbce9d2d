//! Append-only authorization log
//!
//! One file per calendar month, `<prefix>_<YYYY-MM>.log`, one record per
//! line. New records are versioned JSON; the two unit-separated shapes
//! written by earlier deployments are still read:
//!
//! ```text
//! ADD<US>token<US>contract
//! ADD<US>token<US>expiry<US>printedNumber<US>contract
//! ```
//!
//! The cache is rebuilt by replaying every file in name order, which is
//! chronological. Files are never rewritten.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{CachedAuthorization, ContractId, TokenId};
use crate::shared::SharedClock;

/// ASCII record separator used by the legacy line shapes
pub const UNIT_SEPARATOR: char = '\u{1E}';

pub const LOG_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogOperation {
    Add,
    Remove,
}

impl LogOperation {
    fn parse(s: &str) -> Result<Self, LogParseError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADD" => Ok(Self::Add),
            "REMOVE" => Ok(Self::Remove),
            other => Err(LogParseError::UnknownOperation(other.to_string())),
        }
    }
}

/// One parsed log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Add {
        token_id: TokenId,
        authorization: CachedAuthorization,
    },
    Remove {
        token_id: TokenId,
    },
}

impl LogRecord {
    pub fn add(token_id: TokenId, authorization: CachedAuthorization) -> Self {
        Self::Add {
            token_id,
            authorization,
        }
    }

    pub fn remove(token_id: TokenId) -> Self {
        Self::Remove { token_id }
    }

    pub fn token_id(&self) -> &TokenId {
        match self {
            Self::Add { token_id, .. } | Self::Remove { token_id } => token_id,
        }
    }

    pub fn operation(&self) -> LogOperation {
        match self {
            Self::Add { .. } => LogOperation::Add,
            Self::Remove { .. } => LogOperation::Remove,
        }
    }

    /// Render as a v1 JSON line (without the trailing newline).
    pub fn to_line(&self, at: DateTime<Utc>) -> Result<String, serde_json::Error> {
        let line = match self {
            Self::Add {
                token_id,
                authorization,
            } => JsonLine {
                v: LOG_FORMAT_VERSION,
                op: LogOperation::Add,
                token: token_id.clone(),
                contract: Some(authorization.contract_id.clone()),
                expiry: authorization.expiry,
                printed_number: authorization.printed_number.clone(),
                at: Some(at),
            },
            Self::Remove { token_id } => JsonLine {
                v: LOG_FORMAT_VERSION,
                op: LogOperation::Remove,
                token: token_id.clone(),
                contract: None,
                expiry: None,
                printed_number: None,
                at: Some(at),
            },
        };
        serde_json::to_string(&line)
    }

    /// Parse any supported line shape.
    pub fn parse(line: &str) -> Result<Self, LogParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(LogParseError::Empty);
        }
        if line.trim_start().starts_with('{') {
            return Self::parse_json(line);
        }
        Self::parse_legacy(line)
    }

    fn parse_json(line: &str) -> Result<Self, LogParseError> {
        let json: JsonLine =
            serde_json::from_str(line).map_err(|e| LogParseError::Json(e.to_string()))?;
        if json.v != LOG_FORMAT_VERSION {
            return Err(LogParseError::UnsupportedVersion(json.v));
        }
        match json.op {
            LogOperation::Add => {
                let contract_id = json.contract.ok_or(LogParseError::MissingContract)?;
                Ok(Self::add(
                    json.token,
                    CachedAuthorization {
                        contract_id,
                        expiry: json.expiry,
                        printed_number: json.printed_number,
                    },
                ))
            }
            LogOperation::Remove => Ok(Self::remove(json.token)),
        }
    }

    fn parse_legacy(line: &str) -> Result<Self, LogParseError> {
        let fields: Vec<&str> = line.split(UNIT_SEPARATOR).collect();
        let (operation, token, expiry, printed_number, contract) = match fields.as_slice() {
            [op, token, contract] => (*op, *token, "", "", *contract),
            [op, token, expiry, printed, contract] => (*op, *token, *expiry, *printed, *contract),
            other => return Err(LogParseError::FieldCount(other.len())),
        };

        let operation = LogOperation::parse(operation)?;
        let token = token.trim();
        if token.is_empty() {
            return Err(LogParseError::MissingToken);
        }
        let token_id = TokenId::from(token);

        match operation {
            LogOperation::Remove => Ok(Self::remove(token_id)),
            LogOperation::Add => {
                let contract = contract.trim();
                if contract.is_empty() {
                    return Err(LogParseError::MissingContract);
                }
                let printed_number = Some(printed_number.trim())
                    .filter(|p| !p.is_empty())
                    .map(str::to_string);
                Ok(Self::add(
                    token_id,
                    CachedAuthorization {
                        contract_id: ContractId::from(contract),
                        expiry: parse_expiry(expiry)?,
                        printed_number,
                    },
                ))
            }
        }
    }
}

fn parse_expiry(raw: &str) -> Result<Option<DateTime<Utc>>, LogParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(at.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| Some(naive.and_utc()))
        .map_err(|_| LogParseError::InvalidExpiry(raw.to_string()))
}

#[derive(Serialize, Deserialize)]
struct JsonLine {
    v: u8,
    op: LogOperation,
    token: TokenId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contract: Option<ContractId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    printed_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown operation {0:?}")]
    UnknownOperation(String),
    #[error("expected 3 or 5 fields, found {0}")]
    FieldCount(usize),
    #[error("missing token id")]
    MissingToken,
    #[error("missing contract id")]
    MissingContract,
    #[error("invalid expiry {0:?}")]
    InvalidExpiry(String),
    #[error("invalid JSON record: {0}")]
    Json(String),
    #[error("line is not valid UTF-8")]
    Encoding,
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
}

/// Fold records into a token map; the last record per token wins.
pub fn apply_records(
    map: &mut HashMap<TokenId, CachedAuthorization>,
    records: impl IntoIterator<Item = LogRecord>,
) {
    for record in records {
        match record {
            LogRecord::Add {
                token_id,
                authorization,
            } => {
                map.insert(token_id, authorization);
            }
            LogRecord::Remove { token_id } => {
                map.remove(&token_id);
            }
        }
    }
}

/// What a startup replay found
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: HashMap<TokenId, CachedAuthorization>,
    pub files: usize,
    pub records: usize,
    pub skipped: usize,
}

/// Log file name for the month containing `at`
pub fn file_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.log", prefix, at.format("%Y-%m"))
}

struct OpenLog {
    name: String,
    file: File,
}

pub struct AuthorizationLog {
    directory: PathBuf,
    prefix: String,
    clock: SharedClock,
    current: Mutex<Option<OpenLog>>,
}

impl AuthorizationLog {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
            clock,
            current: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Append one record to the current month's file and sync it to disk.
    pub async fn append(&self, record: &LogRecord) -> std::io::Result<()> {
        let now = self.clock.now();
        let mut line = record
            .to_line(now)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        let name = file_name(&self.prefix, now);
        let mut current = self.current.lock().await;

        let rotate = current.as_ref().map_or(true, |open| open.name != name);
        if rotate {
            fs::create_dir_all(&self.directory).await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.directory.join(&name))
                .await?;
            info!(file = %name, "Opened authorization log");
            *current = Some(OpenLog {
                name: name.clone(),
                file,
            });
        }

        if let Some(open) = current.as_mut() {
            open.file.write_all(line.as_bytes()).await?;
            open.file.sync_data().await?;
        }
        debug!(token_id = %record.token_id(), operation = ?record.operation(), "Authorization log record appended");
        Ok(())
    }

    /// Rebuild the token map from every log file, oldest first.
    ///
    /// A missing directory is an empty log; unreadable lines are skipped.
    pub async fn replay(&self) -> std::io::Result<Replay> {
        let mut replay = Replay::default();

        let mut dir = match fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(replay),
            Err(e) => return Err(e),
        };

        let marker = format!("{}_", self.prefix);
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&marker) && name.ends_with(".log") {
                files.push(name);
            }
        }
        files.sort();

        for name in files {
            let content = fs::read(self.directory.join(&name)).await?;
            replay.files += 1;

            let mut records = Vec::new();
            for (index, raw) in content.split(|b| *b == b'\n').enumerate() {
                let parsed = std::str::from_utf8(raw)
                    .map_err(|_| LogParseError::Encoding)
                    .and_then(LogRecord::parse);
                match parsed {
                    Ok(record) => records.push(record),
                    Err(LogParseError::Empty) => {}
                    Err(e) => {
                        replay.skipped += 1;
                        warn!(file = %name, line = index + 1, error = %e, "Skipping malformed authorization log line");
                    }
                }
            }
            replay.records += records.len();
            apply_records(&mut replay.entries, records);
        }

        info!(
            files = replay.files,
            records = replay.records,
            skipped = replay.skipped,
            tokens = replay.entries.len(),
            "Authorization log replayed"
        );
        Ok(replay)
    }
}
