//! Console entries mirrored to a JSON-lines file.
//!
//! New batches are appended. When the in-memory ring evicts, the whole file
//! is rewritten with the retained tail (temp file + rename) so it never grows
//! past the ring's capacity by more than one batch.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use gasoline_types::LogEntry;
use tracing::{debug, warn};

use crate::error::PersistError;

#[derive(Debug, Clone)]
pub struct ConsoleLog {
    path: PathBuf,
}

impl ConsoleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back the newest `max` entries. A missing file is an empty log;
    /// malformed lines are skipped.
    pub fn load(&self, max: usize) -> Result<Vec<LogEntry>, PersistError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistError::io(&self.path, e)),
        };
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| PersistError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(path = %self.path.display(), skipped, "skipped malformed console log lines");
        }
        if entries.len() > max {
            entries.drain(..entries.len() - max);
        }
        Ok(entries)
    }

    pub fn append(&self, entries: &[LogEntry]) -> Result<(), PersistError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PersistError::io(&self.path, e))?;
        let mut out = BufWriter::new(file);
        write_lines(&mut out, entries).map_err(|e| self.wrap(e))?;
        out.flush().map_err(|e| PersistError::io(&self.path, e))?;
        debug!(path = %self.path.display(), count = entries.len(), "appended console entries");
        Ok(())
    }

    /// Replaces the file with exactly `entries`.
    pub fn rewrite(&self, entries: &[LogEntry]) -> Result<(), PersistError> {
        self.ensure_parent()?;
        let tmp = self.path.with_extension("jsonl.tmp");
        let result = (|| {
            let file = File::create(&tmp).map_err(|e| PersistError::io(&tmp, e))?;
            let mut out = BufWriter::new(file);
            write_lines(&mut out, entries).map_err(|e| self.wrap(e))?;
            out.flush().map_err(|e| PersistError::io(&tmp, e))?;
            fs::rename(&tmp, &self.path).map_err(|e| PersistError::io(&self.path, e))
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    pub fn truncate(&self) -> Result<(), PersistError> {
        self.rewrite(&[])
    }

    fn ensure_parent(&self) -> Result<(), PersistError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                fs::create_dir_all(dir).map_err(|e| PersistError::io(dir, e))
            }
            _ => Ok(()),
        }
    }

    fn wrap(&self, e: LineError) -> PersistError {
        match e {
            LineError::Io(e) => PersistError::io(&self.path, e),
            LineError::Encode(e) => PersistError::Encode(e),
        }
    }
}

enum LineError {
    Io(std::io::Error),
    Encode(serde_json::Error),
}

fn write_lines(out: &mut impl Write, entries: &[LogEntry]) -> Result<(), LineError> {
    for entry in entries {
        serde_json::to_writer(&mut *out, entry).map_err(LineError::Encode)?;
        out.write_all(b"\n").map_err(LineError::Io)?;
    }
    Ok(())
}
