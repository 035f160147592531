//! Append-only JSONL files, one per node per day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogEntry;

/// Appends entries to `logs/raw/<date>_<node>.jsonl`
pub struct NodeLogWriter {
    node: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl NodeLogWriter {
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> std::io::Result<Self> {
        let node = sanitize(&node.into());
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, node));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            node,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one entry as a single line and flush it.
    pub fn write(&self, entry: &LogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for NodeLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Node labels become file names
fn sanitize(node: &str) -> String {
    let cleaned: String = node
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "node".into()
    } else {
        cleaned
    }
}

/// Entries from every raw log file, oldest first. `date` (`YYYY-MM-DD`)
/// restricts to one day. Unparseable lines are counted and skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>, date: Option<&str>) -> std::io::Result<(Vec<LogEntry>, usize)> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok((Vec::new(), 0));
    }

    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for file in fs::read_dir(&raw_dir)? {
        let path = file?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".jsonl") || date.is_some_and(|d| !name.starts_with(d)) {
            continue;
        }
        for line in fs::read_to_string(&path)?.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match LogEntry::from_json_line(line) {
                Ok(entry) => entries.push(entry),
                Err(_) => skipped += 1,
            }
        }
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok((entries, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_appends_lines() {
        let temp = TempDir::new().unwrap();
        let writer = NodeLogWriter::new(temp.path(), "den-pc").unwrap();
        writer.write(&LogEntry::new("info", "den-pc", "t", "first")).unwrap();
        writer.write(&LogEntry::new("debug", "den-pc", "t", "second")).unwrap();

        assert!(writer.path().to_string_lossy().ends_with("_den-pc.jsonl"));
        let content = fs::read_to_string(writer.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_node_label_is_sanitized() {
        let temp = TempDir::new().unwrap();
        let writer = NodeLogWriter::new(temp.path(), "Living Room/PC").unwrap();
        assert_eq!(writer.node(), "Living_Room_PC");
    }

    #[test]
    fn test_read_entries_merges_nodes_and_skips_garbage() {
        let temp = TempDir::new().unwrap();
        let a = NodeLogWriter::new(temp.path(), "a").unwrap();
        let b = NodeLogWriter::new(temp.path(), "b").unwrap();
        a.write(&LogEntry::new("info", "a", "t", "from a")).unwrap();
        b.write(&LogEntry::new("warn", "b", "t", "from b")).unwrap();

        let mut file = OpenOptions::new().append(true).open(a.path()).unwrap();
        writeln!(file, "not json").unwrap();
        drop(a);
        drop(b);

        let (entries, skipped) = read_entries(temp.path(), None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(skipped, 1);

        let (none, _) = read_entries(temp.path(), Some("1999-01-01")).unwrap();
        assert!(none.is_empty());
    }
}
