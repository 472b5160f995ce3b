//! Per-chunk output artifacts.
//!
//! Each chunk is written to its own delimited text file: one record per source
//! row, fields in source column order, no header and no quoting. Records are
//! staged in a temporary file next to the destination and persisted on
//! [`ArtifactWriter::finish`], so a failed chunk never leaves a half-written
//! artifact behind. In `append` mode the existing file is extended in place and
//! truncated back to its original length if the chunk fails.

use crate::config::{IfExists, OutputConfig};
use crate::error::ChunkError;
use crate::plan::Chunk;
use crate::source::Row;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// How rows are rendered into records.
#[derive(Debug, Clone)]
pub struct RecordFormat {
    field_delimiter: u8,
    line_terminator: u8,
    null_text: String,
    reject_nulls: bool,
    num_columns: usize,
}

impl RecordFormat {
    /// Build the record format for a table with `num_columns` columns.
    /// Delimiters are validated as ASCII by `Config::validate`.
    pub fn new(output: &OutputConfig, num_columns: usize) -> Self {
        Self {
            field_delimiter: output.field_delimiter as u8,
            line_terminator: output.line_terminator as u8,
            null_text: output.null_text.clone(),
            reject_nulls: output.reject_nulls,
            num_columns,
        }
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Render the fields of one row, checking width and NULL policy.
    pub fn fields<'a>(&'a self, row_number: u64, row: &'a Row) -> Result<Vec<&'a str>, ChunkError> {
        if row.len() != self.num_columns {
            return Err(ChunkError::Serialization {
                row: row_number,
                message: format!("expected {} columns, got {}", self.num_columns, row.len()),
            });
        }

        row.iter()
            .enumerate()
            .map(|(col, value)| match value {
                Some(text) => Ok(text.as_str()),
                None if self.reject_nulls => Err(ChunkError::Serialization {
                    row: row_number,
                    message: format!("NULL in column {}", col),
                }),
                None => Ok(self.null_text.as_str()),
            })
            .collect()
    }

    /// Write one record: fields joined by the delimiter, then the terminator.
    /// Values are copied verbatim, an empty single field included.
    pub fn write_record<W: Write>(&self, out: &mut W, fields: &[&str]) -> io::Result<()> {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.write_all(&[self.field_delimiter])?;
            }
            out.write_all(field.as_bytes())?;
        }
        out.write_all(&[self.line_terminator])
    }
}

/// Render the artifact file name for a chunk.
pub fn artifact_name(template: &str, chunk: &Chunk) -> String {
    template
        .replace("{index}", &chunk.index.to_string())
        .replace("{start}", &chunk.start.to_string())
        .replace("{end}", &chunk.end.to_string())
}

/// A finished artifact.
#[derive(Debug, Clone)]
pub struct ArtifactStats {
    pub path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
}

enum Sink {
    Staged(NamedTempFile),
    Append(File),
}

/// Write-side byte counter around the underlying file.
struct CountingSink {
    sink: Sink,
    bytes: u64,
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.sink {
            Sink::Staged(file) => file.write(buf)?,
            Sink::Append(file) => file.write(buf)?,
        };
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Staged(file) => file.flush(),
            Sink::Append(file) => file.flush(),
        }
    }
}

/// Writer for a single chunk's artifact.
pub struct ArtifactWriter {
    path: PathBuf,
    policy: IfExists,
    format: RecordFormat,
    writer: BufWriter<CountingSink>,
    rows: u64,
    /// Length of the pre-existing file in append mode
    original_len: Option<u64>,
}

impl ArtifactWriter {
    /// Open the artifact `directory/name` according to `policy`.
    pub fn create(
        directory: &Path,
        name: &str,
        format: &RecordFormat,
        policy: IfExists,
    ) -> Result<Self, ChunkError> {
        let path = directory.join(name);

        let (sink, original_len) = match policy {
            IfExists::Append => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| ChunkError::artifact(&path, e))?;
                let len = file.metadata().map_err(|e| ChunkError::artifact(&path, e))?.len();
                (Sink::Append(file), Some(len))
            }
            IfExists::Reject if path.exists() => {
                return Err(ChunkError::artifact(&path, "already exists"));
            }
            IfExists::Reject | IfExists::Overwrite => {
                let staged = tempfile::Builder::new()
                    .prefix(&format!(".{}.", name))
                    .suffix(".part")
                    .tempfile_in(directory)
                    .map_err(|e| ChunkError::artifact(&path, e))?;
                (Sink::Staged(staged), None)
            }
        };

        let writer = BufWriter::new(CountingSink { sink, bytes: 0 });

        Ok(Self {
            path,
            policy,
            format: format.clone(),
            writer,
            rows: 0,
            original_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append one row as a record.
    pub fn write_row(&mut self, row: &Row) -> Result<(), ChunkError> {
        let row_number = self.rows + 1;
        let fields = self.format.fields(row_number, row)?;
        self.format
            .write_record(&mut self.writer, &fields)
            .map_err(|e| ChunkError::artifact(&self.path, e))?;
        self.rows = row_number;
        Ok(())
    }

    /// Flush and persist the artifact at its final path.
    pub fn finish(self) -> Result<ArtifactStats, ChunkError> {
        let path = self.path;
        let sink = match self.writer.into_inner() {
            Ok(sink) => sink,
            Err(e) => {
                let err = ChunkError::artifact(&path, e.error());
                drop(e);
                if let Some(len) = self.original_len {
                    truncate(&path, len);
                }
                return Err(err);
            }
        };
        let bytes = sink.bytes;

        match sink.sink {
            Sink::Staged(staged) => {
                let persisted = match self.policy {
                    IfExists::Reject => staged.persist_noclobber(&path),
                    _ => staged.persist(&path),
                };
                persisted.map_err(|e| ChunkError::artifact(&path, e.error))?;
            }
            Sink::Append(mut file) => {
                if let Err(e) = file.flush().and_then(|_| file.sync_data()) {
                    drop(file);
                    if let Some(len) = self.original_len {
                        truncate(&path, len);
                    }
                    return Err(ChunkError::artifact(&path, e));
                }
            }
        }

        Ok(ArtifactStats {
            path,
            rows: self.rows,
            bytes,
        })
    }

    /// Abandon the artifact, removing everything this writer produced.
    pub fn discard(self) {
        let path = self.path;
        let original_len = self.original_len;
        // Dropping a staged writer deletes its temporary file.
        drop(self.writer);
        if let Some(len) = original_len {
            truncate(&path, len);
        }
    }
}

fn truncate(path: &Path, len: u64) {
    let result = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(len));
    if let Err(e) = result {
        tracing::warn!("Failed to roll back {} to {} bytes: {}", path.display(), len, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn format(columns: usize) -> RecordFormat {
        RecordFormat::new(&OutputConfig::default(), columns)
    }

    fn row(values: &[&str]) -> Row {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    fn write_rows(dir: &Path, name: &str, rows: &[Row], policy: IfExists) -> Result<ArtifactStats, ChunkError> {
        let mut writer = ArtifactWriter::create(dir, name, &format(3), policy)?;
        for r in rows {
            writer.write_row(r)?;
        }
        writer.finish()
    }

    fn leftover_parts(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .count()
    }

    #[test]
    fn test_artifact_name() {
        let chunk = Chunk { index: 2, start: 100_001, end: 100_001 };
        assert_eq!(
            artifact_name("Ch{index}_ExportingRows_{start}_{end}.csv", &chunk),
            "Ch2_ExportingRows_100001_100001.csv"
        );
    }

    #[test]
    fn test_records_have_columns_minus_one_delimiters() {
        let dir = TempDir::new().unwrap();
        let rows = vec![row(&["1", "a", "x"]), row(&["2", "b", "y"]), row(&["3", "c", "z"])];

        let stats = write_rows(dir.path(), "out.csv", &rows, IfExists::Overwrite).unwrap();
        assert_eq!(stats.rows, 3);

        let content = fs::read_to_string(&stats.path).unwrap();
        assert_eq!(content, "1;a;x\n2;b;y\n3;c;z\n");
        assert_eq!(stats.bytes, content.len() as u64);
        for line in content.lines() {
            assert_eq!(line.matches(';').count(), 2);
        }
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[test]
    fn test_values_written_verbatim() {
        let dir = TempDir::new().unwrap();
        let rows = vec![row(&["1", "with \"quotes\"", "a,b"])];
        let stats = write_rows(dir.path(), "raw.csv", &rows, IfExists::Overwrite).unwrap();
        let content = fs::read_to_string(&stats.path).unwrap();
        assert_eq!(content, "1;with \"quotes\";a,b\n");
    }

    #[test]
    fn test_null_handling() {
        let mut output = OutputConfig::default();
        output.null_text = "NULL".to_string();
        let fmt = RecordFormat::new(&output, 2);
        let r: Row = vec![Some("1".to_string()), None];
        assert_eq!(fmt.fields(1, &r).unwrap(), vec!["1", "NULL"]);

        output.reject_nulls = true;
        let fmt = RecordFormat::new(&output, 2);
        let err = fmt.fields(4, &r).unwrap_err();
        assert!(matches!(err, ChunkError::Serialization { row: 4, .. }));
    }

    #[test]
    fn test_width_mismatch_is_serialization_error() {
        let fmt = format(3);
        let err = fmt.fields(1, &row(&["1", "2"])).unwrap_err();
        assert!(matches!(err, ChunkError::Serialization { .. }));
    }

    #[test]
    fn test_single_empty_column_is_not_quoted() {
        let dir = TempDir::new().unwrap();
        let fmt = RecordFormat::new(&OutputConfig::default(), 1);
        let mut writer = ArtifactWriter::create(dir.path(), "one.csv", &fmt, IfExists::Overwrite).unwrap();
        writer.write_row(&vec![None]).unwrap();
        writer.write_row(&vec![Some(String::new())]).unwrap();
        writer.write_row(&vec![Some("x".to_string())]).unwrap();

        let stats = writer.finish().unwrap();
        assert_eq!(fs::read_to_string(&stats.path).unwrap(), "\n\nx\n");
        assert_eq!(stats.bytes, 4);
    }

    #[test]
    fn test_empty_fields_keep_their_delimiters() {
        let dir = TempDir::new().unwrap();
        let rows = vec![vec![None, Some(String::new()), None]];
        let stats = write_rows(dir.path(), "empty.csv", &rows, IfExists::Overwrite).unwrap();
        assert_eq!(fs::read_to_string(&stats.path).unwrap(), ";;\n");
    }

    #[test]
    fn test_overwrite_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "stale\n").unwrap();

        write_rows(dir.path(), "out.csv", &[row(&["1", "2", "3"])], IfExists::Overwrite).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1;2;3\n");
    }

    #[test]
    fn test_reject_leaves_existing_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "previous\n").unwrap();

        let err = write_rows(dir.path(), "out.csv", &[row(&["1", "2", "3"])], IfExists::Reject)
            .unwrap_err();
        assert!(matches!(err, ChunkError::Artifact { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "previous\n");
    }

    #[test]
    fn test_append_extends_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "0;0;0\n").unwrap();

        let stats = write_rows(dir.path(), "out.csv", &[row(&["1", "2", "3"])], IfExists::Append).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0;0;0\n1;2;3\n");
        assert_eq!(stats.bytes, 6);
    }

    #[test]
    fn test_discard_removes_staged_output() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArtifactWriter::create(dir.path(), "gone.csv", &format(3), IfExists::Overwrite).unwrap();
        writer.write_row(&row(&["1", "2", "3"])).unwrap();
        writer.discard();

        assert!(!dir.path().join("gone.csv").exists());
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[test]
    fn test_discard_rolls_back_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "keep\n").unwrap();

        let mut writer = ArtifactWriter::create(dir.path(), "out.csv", &format(3), IfExists::Append).unwrap();
        for i in 0..1000 {
            writer.write_row(&row(&[&i.to_string(), "b", "c"])).unwrap();
        }
        writer.discard();

        assert_eq!(fs::read_to_string(&path).unwrap(), "keep\n");
    }
}
