use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use herald_api::{now_ms, Epoch, Payload, Sequence};

use crate::StoreError;

pub const LOG_FILE_NAME: &str = "log.jsonl";
/// Holds the decimal [`Epoch`] of the log next to it.
pub const EPOCH_FILE_NAME: &str = "epoch";

/// One line of a topic log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: Sequence,
    pub ts_ms: i64,
    pub payload: Payload,
}

// ════════════════════════════════════════════════════════════════
//  DurableLog
// ════════════════════════════════════════════════════════════════

/// Append handle on `<topic dir>/log.jsonl`.
///
/// `len` is the size of the committed prefix. Bytes past it are never
/// trusted: a failed append is cut back to `len`, and so is anything that
/// shows up behind the handle's back before the next append.
pub(crate) struct DurableLog {
    path: PathBuf,
    file: File,
    len: u64,
    /// Set when the file can no longer be brought back to `len`.
    poisoned: Option<String>,
}

/// What [`DurableLog::open`] found on disk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Recovered {
    pub last_sequence: Sequence,
    pub records: usize,
    /// Bytes cut from an interrupted final write.
    pub truncated: u64,
    pub epoch: Epoch,
}

impl DurableLog {
    /// Open (creating if needed) the log in `dir` and validate its contents.
    ///
    /// Every complete line must hold a record whose `seq` is exactly one
    /// past the previous. A final line without a newline is an append that
    /// never finished; it is cut off. Anything else is [`StoreError::Corrupt`].
    pub fn open(dir: &Path) -> Result<(Self, Recovered), StoreError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::io(format!("mkdir {}", dir.display()), e))?;
        let path = dir.join(LOG_FILE_NAME);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(format!("open {}", path.display()), e))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;

        let mut recovered = Recovered::default();
        let mut offset = 0usize;
        let mut line_no = 0usize;

        while offset < bytes.len() {
            line_no += 1;
            let rest = &bytes[offset..];
            let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
                recovered.truncated = rest.len() as u64;
                break;
            };
            let line = &rest[..newline];
            offset += newline + 1;
            if line.is_empty() {
                continue;
            }

            let record: LogRecord = serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                line: line_no,
                reason: e.to_string(),
            })?;
            if record.seq != recovered.last_sequence + 1 {
                return Err(StoreError::Corrupt {
                    path,
                    line: line_no,
                    reason: format!(
                        "sequence {} follows {}",
                        record.seq, recovered.last_sequence
                    ),
                });
            }
            recovered.last_sequence = record.seq;
            recovered.records += 1;
        }

        if recovered.truncated > 0 {
            file.set_len(offset as u64)
                .map_err(|e| StoreError::io(format!("truncate {}", path.display()), e))?;
            file.sync_all()
                .map_err(|e| StoreError::io(format!("sync {}", path.display()), e))?;
            tracing::warn!(
                path = %path.display(),
                bytes = recovered.truncated,
                "cut interrupted write from log tail"
            );
        }

        recovered.epoch = load_or_create_epoch(dir, recovered.records == 0)?;

        let log = Self {
            path,
            file,
            len: offset as u64,
            poisoned: None,
        };
        Ok((log, recovered))
    }

    /// Write one record and commit it to stable storage.
    ///
    /// On failure the file is cut back to its previous length, so a retry
    /// starts from a clean tail. If even that fails the log refuses all
    /// further appends.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), StoreError> {
        if let Some(reason) = &self.poisoned {
            return Err(StoreError::Poisoned {
                path: self.path.clone(),
                reason: reason.clone(),
            });
        }
        self.discard_stray_tail()?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let written = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync_data());

        match written {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), seq = record.seq, error = %e, "append failed, rolling back");
                self.truncate_to_committed();
                Err(StoreError::io(format!("append {}", self.path.display()), e))
            }
        }
    }

    /// Bring the file back to the committed length before writing.
    fn discard_stray_tail(&mut self) -> Result<(), StoreError> {
        let actual = self
            .file
            .metadata()
            .map_err(|e| StoreError::io(format!("stat {}", self.path.display()), e))?
            .len();

        if actual < self.len {
            let reason = format!("log shrank from {} to {actual} bytes", self.len);
            tracing::error!(path = %self.path.display(), %reason, "refusing further appends");
            self.poisoned = Some(reason.clone());
            return Err(StoreError::Poisoned {
                path: self.path.clone(),
                reason,
            });
        }
        if actual > self.len {
            tracing::warn!(
                path = %self.path.display(),
                bytes = actual - self.len,
                "discarding uncommitted bytes at log tail"
            );
            self.truncate_to_committed();
            if let Some(reason) = &self.poisoned {
                return Err(StoreError::Poisoned {
                    path: self.path.clone(),
                    reason: reason.clone(),
                });
            }
        }
        Ok(())
    }

    fn truncate_to_committed(&mut self) {
        let cut = self
            .file
            .set_len(self.len)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = cut {
            tracing::error!(path = %self.path.display(), error = %e, "cannot roll back log tail, refusing further appends");
            self.poisoned = Some(format!("rollback to {} bytes failed: {e}", self.len));
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.file
            .sync_all()
            .map_err(|e| StoreError::io(format!("sync {}", self.path.display()), e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read the epoch stored in `dir`, or mint a new one when there is none
/// or the log starts empty. A new epoch is always above the previous one.
fn load_or_create_epoch(dir: &Path, fresh: bool) -> Result<Epoch, StoreError> {
    let path = dir.join(EPOCH_FILE_NAME);
    let previous = match std::fs::read_to_string(&path) {
        Ok(text) => match text.trim().parse::<Epoch>() {
            Ok(epoch) => Some(epoch),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable epoch file, minting a new epoch");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(StoreError::io(format!("read {}", path.display()), e)),
    };

    if let (Some(epoch), false) = (previous, fresh) {
        return Ok(epoch);
    }

    let epoch = (now_ms().max(1) as Epoch).max(previous.map_or(0, |p| p + 1));
    let tmp = dir.join(format!("{EPOCH_FILE_NAME}.tmp"));
    let mut f = File::create(&tmp).map_err(|e| StoreError::io(format!("create {}", tmp.display()), e))?;
    writeln!(f, "{epoch}")
        .and_then(|()| f.sync_all())
        .map_err(|e| StoreError::io(format!("write {}", tmp.display()), e))?;
    std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(format!("rename {}", tmp.display()), e))?;
    Ok(epoch)
}

/// Move a damaged log out of the way as `log.jsonl.corrupt-<ms>`.
pub(crate) fn quarantine(dir: &Path) -> Result<PathBuf, StoreError> {
    let from = dir.join(LOG_FILE_NAME);
    let to = dir.join(format!("{LOG_FILE_NAME}.corrupt-{}", now_ms()));
    std::fs::rename(&from, &to)
        .map_err(|e| StoreError::io(format!("quarantine {}", from.display()), e))?;
    Ok(to)
}

// ════════════════════════════════════════════════════════════════
//  LogScan
// ════════════════════════════════════════════════════════════════

/// Forward reader over the records of a log, independent of the append handle.
pub(crate) struct LogScan {
    path: PathBuf,
    reader: BufReader<File>,
    line: Vec<u8>,
    line_no: usize,
}

impl LogScan {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path).map_err(|e| StoreError::io(format!("open {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: Vec::new(),
            line_no: 0,
        })
    }

    /// Next complete record, or `None` at end of file. A trailing line with
    /// no newline is an append still in flight and reads as end of file.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, StoreError> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.line)
                .map_err(|e| StoreError::io(format!("read {}", self.path.display()), e))?;
            if n == 0 || self.line.last() != Some(&b'\n') {
                return Ok(None);
            }
            self.line_no += 1;
            let body = &self.line[..self.line.len() - 1];
            if body.is_empty() {
                continue;
            }
            let record = serde_json::from_slice(body).map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                line: self.line_no,
                reason: e.to_string(),
            })?;
            return Ok(Some(record));
        }
    }
}
