//! Append-only durability: preamble + append log.
//!
//! Two on-disk pieces live in the data directory. The `preamble` is a
//! full keyspace image in the shared state-record format. `aof.log` is
//! an append-only stream of raw RESP command payloads, each framed as
//! `[len: u32][payload][crc32]` after a `VAOF` header.
//!
//! Logged commands flow through a bounded queue into a background writer
//! task, which applies the fsync policy — the caller never syncs.
//! Restore replays the preamble first, then each logged command through
//! the standard execution path with durability side-effects disabled
//! (the server drives that; this module exposes the readers).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};
use vesper_core::StateEntry;

use crate::format::{self, FormatError};
use crate::record;

/// Capacity of the bounded command queue feeding the writer task.
const LOG_QUEUE_CAPACITY: usize = 4096;

/// Configurable fsync policy for the AOF writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every record. Safest, slowest.
    Always,
    /// fsync once per second from the writer task.
    #[default]
    EverySec,
    /// Let the OS decide when to flush.
    No,
}

impl std::str::FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            other => Err(format!(
                "unknown fsync policy '{other}'. valid options: always, everysec, no"
            )),
        }
    }
}

/// Path of the append log inside a data directory.
pub fn log_path(data_dir: &Path) -> PathBuf {
    data_dir.join("aof.log")
}

/// Path of the preamble inside a data directory.
pub fn preamble_path(data_dir: &Path) -> PathBuf {
    data_dir.join("preamble")
}

/// Buffered writer for appending raw command records to the log.
pub struct AppendWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl AppendWriter {
    /// Opens (or creates) the append log. A new file gets the header;
    /// an existing one is appended to.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FormatError> {
        let path = path.into();
        let exists = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if !exists {
            format::write_header(&mut writer, format::AOF_MAGIC)?;
            writer.flush()?;
        }
        Ok(Self { writer, path })
    }

    /// Appends one raw command payload: `[len][payload][crc32]`.
    pub fn write_record(&mut self, payload: &[u8]) -> Result<(), FormatError> {
        format::write_bytes(&mut self.writer, payload)?;
        format::write_u32(&mut self.writer, format::crc32(payload))?;
        Ok(())
    }

    /// Flushes the internal buffer to the OS.
    pub fn flush(&mut self) -> Result<(), FormatError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs to disk.
    pub fn sync(&mut self) -> Result<(), FormatError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Truncates the log back to just the header. Used after a rewrite
    /// produced a fresh preamble.
    pub fn truncate(&mut self) -> Result<(), FormatError> {
        self.writer.flush()?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        format::write_header(&mut writer, format::AOF_MAGIC)?;
        writer.flush()?;
        // the fresh header must be durable before appends resume
        writer.get_ref().sync_all()?;
        self.writer = writer;
        Ok(())
    }
}

/// Reader for iterating over logged command payloads.
pub struct AppendReader {
    reader: BufReader<File>,
}

impl AppendReader {
    /// Opens the append log and validates the header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        format::read_header(&mut reader, format::AOF_MAGIC)?;
        Ok(Self { reader })
    }

    /// Reads the next command payload.
    ///
    /// Returns `Ok(None)` at end-of-file. A truncated trailing record
    /// (crash mid-write) is also reported as `Ok(None)` — that is the
    /// expected recovery behavior.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, FormatError> {
        let payload = match format::read_bytes(&mut self.reader) {
            Ok(p) => p,
            Err(FormatError::UnexpectedEof) => return Ok(None),
            Err(e) => return Err(e),
        };
        let stored = match format::read_u32(&mut self.reader) {
            Ok(c) => c,
            Err(FormatError::UnexpectedEof) => return Ok(None),
            Err(e) => return Err(e),
        };
        format::verify_crc32(&payload, stored)?;
        Ok(Some(payload))
    }
}

/// Writes the preamble: the full state image, to a temp file renamed
/// into place atomically.
pub fn write_preamble(
    data_dir: &Path,
    written_unix_ms: i64,
    state: &[StateEntry],
) -> Result<(), FormatError> {
    let final_path = preamble_path(data_dir);
    let tmp_path = final_path.with_extension("tmp");

    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    record::write_state_file(&mut writer, format::PREAMBLE_MAGIC, written_unix_ms, state)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Reads the preamble, rebasing TTLs against `now_unix_ms` and dropping
/// entries already expired. Returns an empty vec when no preamble
/// exists yet.
pub fn read_preamble(data_dir: &Path, now_unix_ms: i64) -> Result<Vec<StateEntry>, FormatError> {
    let path = preamble_path(data_dir);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let (written, entries) = record::read_state_file(&mut reader, format::PREAMBLE_MAGIC)?;
    Ok(record::filter_expired(entries, written, now_unix_ms))
}

/// Reads every logged command payload. Stops cleanly at a truncated
/// tail. Returns an empty vec when no log exists yet.
pub fn read_log(data_dir: &Path) -> Result<Vec<Vec<u8>>, FormatError> {
    let path = log_path(data_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = AppendReader::open(&path)?;
    let mut commands = Vec::new();
    while let Some(cmd) = reader.read_record()? {
        commands.push(cmd);
    }
    Ok(commands)
}

/// The standalone AOF engine: bounded log queue, background writer with
/// the configured fsync policy, and the serialized rewrite path.
pub struct AofEngine {
    tx: mpsc::Sender<Bytes>,
    /// Shared with the writer task; the rewrite path locks it across
    /// truncate so appends cannot interleave.
    writer: Arc<StdMutex<AppendWriter>>,
    /// Serializes concurrent rewrites.
    rewrite_mutex: Mutex<()>,
    /// Raised while a rewrite is in flight.
    rewrite_in_progress: Arc<AtomicBool>,
    data_dir: PathBuf,
}

impl AofEngine {
    /// Opens the log, spawns the writer task, and returns the engine
    /// handle. `rewrite_in_progress` is the server's shared gate flag.
    pub fn start(
        data_dir: impl Into<PathBuf>,
        fsync: FsyncPolicy,
        rewrite_in_progress: Arc<AtomicBool>,
    ) -> Result<Self, FormatError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let writer = Arc::new(StdMutex::new(AppendWriter::open(log_path(&data_dir))?));

        let (tx, rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
        tokio::spawn(writer_task(rx, Arc::clone(&writer), fsync));

        Ok(Self {
            tx,
            writer,
            rewrite_mutex: Mutex::new(()),
            rewrite_in_progress,
            data_dir,
        })
    }

    /// Enqueues a raw command for the writer task. Preserves submission
    /// order per caller; applies backpressure when the queue is full.
    pub async fn queue_command(&self, command: Bytes) {
        if self.tx.send(command).await.is_err() {
            error!("aof writer task is gone; command not logged");
        }
    }

    /// Rewrites the log: writes a fresh preamble from `state`, then
    /// truncates the append log. Concurrent rewrites are serialized by
    /// a single mutex; the in-progress flag is raised for the duration.
    pub async fn rewrite_log(&self, now_unix_ms: i64, state: &[StateEntry]) -> Result<(), FormatError> {
        let _serialized = self.rewrite_mutex.lock().await;
        self.rewrite_in_progress.store(true, Ordering::SeqCst);

        let result = (|| {
            write_preamble(&self.data_dir, now_unix_ms, state)?;
            // hold the writer lock across truncate so the writer task
            // cannot interleave an append mid-reset
            let mut writer = self.writer.lock().expect("aof writer poisoned");
            writer.truncate()
        })();

        self.rewrite_in_progress.store(false, Ordering::SeqCst);
        result
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Drains the command queue into the log, applying the fsync policy.
/// Errors are logged; the task keeps consuming so the queue never
/// wedges the dispatchers.
async fn writer_task(
    mut rx: mpsc::Receiver<Bytes>,
    writer: Arc<StdMutex<AppendWriter>>,
    fsync: FsyncPolicy,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut dirty = false;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                let mut writer = writer.lock().expect("aof writer poisoned");
                let result = writer.write_record(&cmd).and_then(|_| match fsync {
                    FsyncPolicy::Always => writer.sync(),
                    FsyncPolicy::EverySec => {
                        dirty = true;
                        writer.flush()
                    }
                    FsyncPolicy::No => writer.flush(),
                });
                if let Err(e) = result {
                    warn!("aof append failed: {e}");
                }
            }
            _ = tick.tick(), if fsync == FsyncPolicy::EverySec => {
                if dirty {
                    dirty = false;
                    let mut writer = writer.lock().expect("aof writer poisoned");
                    if let Err(e) = writer.sync() {
                        warn!("aof fsync failed: {e}");
                    }
                }
            }
        }
    }
}
