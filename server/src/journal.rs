//! Append-only JSON-lines journal of run progress.
//!
//! One file per run. Each applied or failed operation is appended and
//! flushed as soon as it is known, so the journal survives a crash that the
//! in-memory report would not.

use converge_engine::{ReconciliationReport, ReportEntry, ReportLine};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// Open (or create) the journal for `run_id` inside `dir`.
    pub async fn open(dir: &Path, run_id: &str) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{run_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one report entry.
    pub async fn entry(&self, seq: usize, entry: &ReportEntry) -> io::Result<()> {
        let line = ReportLine::entry(seq, entry)
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.append(&line).await
    }

    /// Append the full rendering of a finished report.
    pub async fn finish(&self, report: &ReconciliationReport) -> io::Result<()> {
        let text = report
            .to_json_lines()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.append(text.trim_end()).await
    }

    async fn append(&self, line: &str) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_engine::{DeleteOp, Identity, Operation, Outcome};

    #[tokio::test]
    async fn appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path(), "run-1").await.unwrap();

        let entry = ReportEntry {
            operation: Operation::Delete(DeleteOp::new("user", Identity::from("7"))),
            outcome: Outcome::Applied,
            attempts: 1,
        };
        journal.entry(0, &entry).await.unwrap();

        let mut report = ReconciliationReport::new("run-1", vec!["user".into()], "a", "b", 0);
        report.entries.push(entry);
        journal.finish(&report).await.unwrap();

        let text = tokio::fs::read_to_string(journal.path()).await.unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"line\":\"entry\""));
        assert!(lines[1].contains("\"line\":\"run\""));
        assert!(journal.path().ends_with("run-1.jsonl"));
    }
}
