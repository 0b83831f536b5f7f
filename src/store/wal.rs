use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::{Appointment, EntityKind};

/// One durable mutation of the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    AppointmentPut(Appointment),
    /// `body` is the JSON text of the document.
    DocumentPut {
        kind: EntityKind,
        id: String,
        body: String,
    },
    DocumentDeleted {
        kind: EntityKind,
        id: String,
    },
}

/// Encode a single record as `[u32 len][bincode][u32 crc32]`.
fn encode_record(writer: &mut impl Write, record: &Record) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Decode the record starting at `pos`; `None` on a torn or corrupt entry.
fn decode_at(bytes: &[u8], pos: usize) -> Option<(Record, usize)> {
    let len_bytes: [u8; 4] = bytes.get(pos..pos + 4)?.try_into().ok()?;
    let body_start = pos + 4;
    let body_end = body_start.checked_add(u32::from_le_bytes(len_bytes) as usize)?;
    let payload = bytes.get(body_start..body_end)?;
    let crc_bytes: [u8; 4] = bytes.get(body_end..body_end + 4)?.try_into().ok()?;
    if crc32fast::hash(payload) != u32::from_le_bytes(crc_bytes) {
        return None;
    }
    let record = bincode::deserialize(payload).ok()?;
    Some((record, body_end + 4))
}

/// Result of reading a log from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<Record>,
    /// Byte length of the valid prefix.
    pub valid_len: u64,
    pub file_len: u64,
}

/// Append-only log backing the document store.
///
/// A torn or corrupt tail (crash mid-append) is cut off when the log is
/// opened, so later appends never land behind unreadable bytes.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log, returning it with every valid record.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Record>)> {
        let replay = Self::replay(path)?;
        if replay.valid_len < replay.file_len {
            warn!(
                "WAL {}: discarding {} trailing bytes",
                path.display(),
                replay.file_len - replay.valid_len
            );
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(replay.valid_len)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: replay.records.len() as u64,
        };
        Ok((wal, replay.records))
    }

    /// Read every valid record. Stops at the first torn or corrupt entry.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        let mut pos = 0usize;
        while let Some((record, next)) = decode_at(&bytes, pos) {
            records.push(record);
            pos = next;
        }
        Ok(Replay {
            records,
            valid_len: pos as u64,
            file_len: bytes.len() as u64,
        })
    }

    /// Buffer a record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, record: &Record) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `records`: write a temp file, fsync, rename over.
    pub fn rewrite(&mut self, records: &[Record]) -> io::Result<()> {
        self.flush_sync()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                encode_record(&mut tmp, record)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }
}

// ── Group-commit writer ──────────────────────────────────

pub(crate) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Close {
        response: oneshot::Sender<()>,
    },
}

type PendingAppend = (Record, oneshot::Sender<io::Result<()>>);

/// Owns the log. Appends that queue up while a flush is in progress are
/// committed together with a single fsync.
pub(crate) async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (record, response) = match cmd {
            WalCommand::Append { record, response } => (record, response),
            other => {
                if handle_control(&mut wal, other) {
                    return;
                }
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(record, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { record, response } => batch.push((record, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);

        if let Some(cmd) = deferred
            && handle_control(&mut wal, cmd)
        {
            return;
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record));
    // Flush even after a failed append so partial bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns true when the writer should stop.
fn handle_control(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { records, response } => {
            let _ = response.send(wal.rewrite(&records));
            false
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            false
        }
        WalCommand::Close { response } => {
            if let Err(e) = wal.flush_sync() {
                warn!("WAL flush on close failed: {e}");
            }
            let _ = response.send(());
            true
        }
        WalCommand::Append { record, response } => {
            commit_batch(wal, vec![(record, response)]);
            false
        }
    }
}
