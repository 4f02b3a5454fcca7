//! Snapshot persistence
//!
//! Newline-delimited JSON: one schema header line, then one experience per
//! line. Only experience fields are persisted; indices are rebuilt by replay.

use std::io::{BufRead, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use remem_common::{
    Experience, RememError, Result, ValidationError, SNAPSHOT_SCHEMA, SNAPSHOT_VERSION,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// First line of every snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub schema: String,
    pub version: u32,
    pub written_at: DateTime<Utc>,
    pub dimension: usize,
    pub records: usize,
}

impl SnapshotHeader {
    pub fn new(dimension: usize, records: usize) -> Self {
        Self {
            schema: SNAPSHOT_SCHEMA.to_string(),
            version: SNAPSHOT_VERSION,
            written_at: Utc::now(),
            dimension,
            records,
        }
    }

    fn check(&self) -> Result<()> {
        if self.schema != SNAPSHOT_SCHEMA || self.version > SNAPSHOT_VERSION {
            return Err(ValidationError::UnsupportedSchema(format!(
                "{} v{}",
                self.schema, self.version
            ))
            .into());
        }
        Ok(())
    }
}

/// Write a header and every record
pub fn write_snapshot<W: Write>(
    mut writer: W,
    dimension: usize,
    records: &[Experience],
) -> Result<()> {
    let header = SnapshotHeader::new(dimension, records.len());
    serde_json::to_writer(&mut writer, &header)?;
    writer.write_all(b"\n")?;
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Parse a snapshot. Blank lines are ignored.
pub fn read_snapshot<R: BufRead>(reader: R) -> Result<(SnapshotHeader, Vec<Experience>)> {
    let mut lines = reader.lines().enumerate();

    let header: SnapshotHeader = loop {
        match lines.next() {
            Some((_, line)) => {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                break serde_json::from_str(&line)
                    .map_err(|e| RememError::Snapshot(format!("Invalid header: {}", e)))?;
            }
            None => return Err(RememError::Snapshot("Missing header".into())),
        }
    };
    header.check()?;

    let mut records = Vec::with_capacity(header.records);
    for (number, line) in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Experience = serde_json::from_str(&line)
            .map_err(|e| RememError::Snapshot(format!("Line {}: {}", number + 1, e)))?;
        records.push(record);
    }

    if records.len() != header.records {
        warn!(
            expected = header.records,
            actual = records.len(),
            "Snapshot record count differs from header"
        );
    }

    Ok((header, records))
}

/// Write a snapshot file atomically (temp file + rename)
pub async fn save(path: &Path, dimension: usize, records: &[Experience]) -> Result<()> {
    let mut buffer = Vec::new();
    write_snapshot(&mut buffer, dimension, records)?;

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &buffer).await?;
    tokio::fs::rename(&tmp, path).await?;

    info!(path = %path.display(), records = records.len(), "Snapshot written");
    Ok(())
}

/// Read a snapshot file
pub async fn load(path: &Path) -> Result<(SnapshotHeader, Vec<Experience>)> {
    let bytes = tokio::fs::read(path).await?;
    let (header, records) = read_snapshot(bytes.as_slice())?;
    info!(path = %path.display(), records = records.len(), "Snapshot loaded");
    Ok((header, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use remem_common::{TaskInput, VisibilityScope};

    fn records() -> Vec<Experience> {
        (0..3)
            .map(|i| {
                let mut e = Experience::builder("a", "t")
                    .task(TaskInput::new(format!("task {}", i)).with_context("k", "v"))
                    .output("out")
                    .strategy("s")
                    .embedding(vec![i as f32, 1.0])
                    .fitness(0.3)
                    .build()
                    .unwrap();
                if i == 2 {
                    e.visibility = VisibilityScope::Collective;
                    e.breakthrough_at = Some(Utc::now());
                }
                e
            })
            .collect()
    }

    #[test]
    fn test_write_then_read() {
        let original = records();
        let mut buffer = Vec::new();
        write_snapshot(&mut buffer, 2, &original).unwrap();

        let text = String::from_utf8(buffer.clone()).unwrap();
        assert_eq!(text.lines().count(), 4);

        let (header, restored) = read_snapshot(buffer.as_slice()).unwrap();
        assert_eq!(header.records, 3);
        assert_eq!(header.dimension, 2);
        assert_eq!(restored, original);
    }

    #[test]
    fn test_rejects_unknown_schema() {
        let line = concat!(
            r#"{"schema":"other","version":1,"#,
            r#""written_at":"2024-01-01T00:00:00Z","dimension":2,"records":0}"#
        );
        let err = read_snapshot(line.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            RememError::Validation(ValidationError::UnsupportedSchema(_))
        ));
    }

    #[test]
    fn test_reports_bad_line() {
        let mut buffer = Vec::new();
        write_snapshot(&mut buffer, 2, &records()).unwrap();
        buffer.extend_from_slice(b"{not json}\n");
        let err = read_snapshot(buffer.as_slice()).unwrap_err();
        assert!(matches!(err, RememError::Snapshot(msg) if msg.starts_with("Line 5")));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(
            read_snapshot(&b""[..]),
            Err(RememError::Snapshot(_))
        ));
    }

    #[tokio::test]
    async fn test_save_and_load_file() {
        let path = std::env::temp_dir().join(format!(
            "remem-snapshot-{}.ndjson",
            remem_common::ExperienceId::new()
        ));
        let original = records();
        save(&path, 2, &original).await.unwrap();
        let (_, restored) = load(&path).await.unwrap();
        assert_eq!(restored, original);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
