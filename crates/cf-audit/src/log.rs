// log.rs - Append-only JSONL outcome log.
//
// One JSON object per line. Each line carries the SHA-256 of the line before
// it in `previous_hash`, so editing, inserting or deleting a line breaks the
// chain at that point. Hashes are taken over the raw line text, never over a
// re-serialized event.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::AuditError;
use crate::event::OutcomeEvent;
use crate::hasher;

pub struct OutcomeLog {
    writer: BufWriter<File>,
    path: PathBuf,
    last_hash: Option<String>,
    appended: usize,
}

fn open_reader(path: &Path) -> Result<BufReader<File>, AuditError> {
    let file = File::open(path).map_err(|source| AuditError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

impl OutcomeLog {
    /// Open or create the log, recovering the chain head from existing
    /// content. Missing parent directories are created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let open_failed = |source| AuditError::OpenFailed {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_failed)?;
        }
        let last_hash = if path.exists() {
            Self::read_last_hash(&path)?
        } else {
            None
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_failed)?;

        tracing::debug!(path = %path.display(), "outcome log opened");
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            last_hash,
            appended: 0,
        })
    }

    /// Link `event` to the chain head, write it, and flush.
    pub fn append(&mut self, event: &mut OutcomeEvent) -> Result<(), AuditError> {
        event.previous_hash = self.last_hash.clone();
        let json = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        self.last_hash = Some(hasher::hash_str(&json));
        self.appended += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events appended through this handle.
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Every event in the file, oldest first. Blank lines are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<OutcomeEvent>, AuditError> {
        let mut events = Vec::new();
        for line in open_reader(path.as_ref())?.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    /// The last `count` events, oldest first.
    pub fn tail(path: impl AsRef<Path>, count: usize) -> Result<Vec<OutcomeEvent>, AuditError> {
        let mut window: VecDeque<String> = VecDeque::with_capacity(count);
        for line in open_reader(path.as_ref())?.lines() {
            let line = line?;
            if line.trim().is_empty() || count == 0 {
                continue;
            }
            if window.len() == count {
                window.pop_front();
            }
            window.push_back(line);
        }
        window
            .iter()
            .map(|line| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }

    /// Walk the chain; returns the number of events verified.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize, AuditError> {
        let mut previous_hash: Option<String> = None;
        let mut verified = 0;

        for (index, line) in open_reader(path.as_ref())?.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: OutcomeEvent = serde_json::from_str(&line)?;
            if event.previous_hash != previous_hash {
                return Err(AuditError::IntegrityViolation {
                    line: index + 1,
                    expected: previous_hash.unwrap_or_else(|| "None".to_string()),
                    actual: event.previous_hash.unwrap_or_else(|| "None".to_string()),
                });
            }
            previous_hash = Some(hasher::hash_str(&line));
            verified += 1;
        }
        Ok(verified)
    }

    fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
        let mut last_line = None;
        for line in open_reader(path)?.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last_line = Some(line);
            }
        }
        Ok(last_line.map(|line| hasher::hash_str(&line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_eval::PromiseResult;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn outcome(run: Uuid, promiser: &str, result: PromiseResult) -> OutcomeEvent {
        OutcomeEvent::new(run, "default:main", "files", promiser, result, 1)
    }

    #[test]
    fn appended_events_read_back_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        let run = Uuid::new_v4();
        {
            let mut log = OutcomeLog::open(&path).unwrap();
            log.append(&mut outcome(run, "/a", PromiseResult::Noop)).unwrap();
            log.append(&mut outcome(run, "/b", PromiseResult::Change)).unwrap();
            assert_eq!(log.appended(), 2);
        }
        let events = OutcomeLog::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].promiser, "/a");
        assert!(events[0].previous_hash.is_none());
        assert_eq!(events[1].result, PromiseResult::Change);
        assert!(events[1].previous_hash.is_some());
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("outcomes.jsonl");
        let run = Uuid::new_v4();
        for promiser in ["/a", "/b", "/c"] {
            let mut log = OutcomeLog::open(&path).unwrap();
            log.append(&mut outcome(run, promiser, PromiseResult::Noop)).unwrap();
        }
        assert_eq!(OutcomeLog::verify_chain(&path).unwrap(), 3);
    }

    #[test]
    fn edited_line_breaks_the_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        let run = Uuid::new_v4();
        {
            let mut log = OutcomeLog::open(&path).unwrap();
            for promiser in ["/a", "/b", "/c"] {
                log.append(&mut outcome(run, promiser, PromiseResult::Fail)).unwrap();
            }
        }
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replacen("\"/a\"", "\"/z\"", 1)).unwrap();

        match OutcomeLog::verify_chain(&path) {
            Err(AuditError::IntegrityViolation { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected integrity violation, got {:?}", other),
        }
    }

    #[test]
    fn tail_returns_last_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        let run = Uuid::new_v4();
        {
            let mut log = OutcomeLog::open(&path).unwrap();
            for i in 0..10 {
                log.append(&mut outcome(run, &format!("/f{}", i), PromiseResult::Noop))
                    .unwrap();
            }
        }
        let last: Vec<String> = OutcomeLog::tail(&path, 3)
            .unwrap()
            .into_iter()
            .map(|e| e.promiser)
            .collect();
        assert_eq!(last, vec!["/f7", "/f8", "/f9"]);
        assert!(OutcomeLog::tail(&path, 0).unwrap().is_empty());
        assert_eq!(OutcomeLog::tail(&path, 50).unwrap().len(), 10);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            OutcomeLog::read_all(dir.path().join("absent.jsonl")),
            Err(AuditError::OpenFailed { .. })
        ));
    }
}
