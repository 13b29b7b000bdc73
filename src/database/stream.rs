//! Byte-range line streams over table files

use super::split_fields;
use crate::chunk::TableRange;
use crate::error::TaskError;
use crate::Result;
use anyhow::Context;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// Buffered reader yielding the non-empty lines that start inside `[begin, end)`
pub struct LineReader {
    reader: BufReader<File>,
    pos: u64,
    end: u64,
    line_start: u64,
    buf: Vec<u8>,
}

impl LineReader {
    /// Open `path` positioned at `begin`, which must be a line start
    pub fn open(path: &Path, begin: u64, end: u64, capacity: usize) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        file.seek(SeekFrom::Start(begin))
            .with_context(|| format!("Failed to seek to byte {} in {}", begin, path.display()))?;

        Ok(Self {
            reader: BufReader::with_capacity(capacity.max(4096), file),
            pos: begin,
            end,
            line_start: begin,
            buf: Vec::new(),
        })
    }

    /// Open at the first line start at or after `offset`
    pub fn open_aligned(path: &Path, offset: u64, end: u64, capacity: usize) -> Result<Self> {
        if offset == 0 {
            return Self::open(path, 0, end, capacity);
        }
        let mut reader = Self::open(path, offset - 1, end, capacity)?;
        reader.read_raw()?;
        Ok(reader)
    }

    /// Offset of the next unread byte
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Consume one line whatever it holds; false at the end of the range
    pub fn skip_line(&mut self) -> Result<bool> {
        if self.pos >= self.end {
            return Ok(false);
        }
        Ok(self.read_raw()? > 0)
    }

    /// Advance to the next non-empty line, returning its start offset
    pub fn next_line(&mut self) -> Result<Option<u64>> {
        loop {
            if self.pos >= self.end {
                return Ok(None);
            }
            if self.read_raw()? == 0 {
                return Ok(None);
            }
            while matches!(self.buf.last(), Some(b'\n') | Some(b'\r')) {
                self.buf.pop();
            }
            if !self.buf.is_empty() {
                return Ok(Some(self.line_start));
            }
        }
    }

    /// Current line without its terminator
    pub fn line(&self) -> &[u8] {
        &self.buf
    }

    fn read_raw(&mut self) -> Result<usize> {
        self.buf.clear();
        self.line_start = self.pos;
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .with_context(|| format!("Failed to read line at byte {}", self.pos))?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// One parsed line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Byte offset of the line in its file
    pub offset: u64,
    pub fields: Vec<String>,
}

impl Record {
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }
}

/// Record stream over one table range of a chunk
pub struct TableStream {
    table: String,
    reader: LineReader,
    begin: u64,
    end: u64,
    separator: char,
    records: u64,
}

impl TableStream {
    /// Open a range; the header line is skipped when the range starts the file
    pub fn open(
        table: &str,
        path: &Path,
        range: &TableRange,
        header: bool,
        separator: char,
        buffer_size: usize,
    ) -> Result<Self> {
        let mut reader = LineReader::open(path, range.begin, range.end, buffer_size)?;
        if header && range.begin == 0 {
            reader.skip_line()?;
        }

        Ok(Self {
            table: table.to_string(),
            reader,
            begin: range.begin,
            end: range.end,
            separator,
            records: 0,
        })
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(offset) = self.reader.next_line()? else {
            return Ok(None);
        };
        let line = std::str::from_utf8(self.reader.line()).map_err(|e| TaskError::RecordRead {
            table: self.table.clone(),
            offset,
            message: format!("invalid UTF-8: {}", e),
        })?;

        self.records += 1;
        Ok(Some(Record {
            offset,
            fields: split_fields(line, self.separator),
        }))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Records returned so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Share of the range consumed, in percent
    pub fn percent_read(&self) -> f64 {
        if self.end <= self.begin {
            return 100.0;
        }
        let done = self.reader.position().min(self.end) - self.begin;
        done as f64 * 100.0 / (self.end - self.begin) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn range(begin: u64, end: u64) -> TableRange {
        TableRange { begin, end, previous_record_index: 0, records: 0 }
    }

    #[test]
    fn test_header_skipped_only_at_file_start() {
        let file = table_file("id\tv\na\t1\nb\t2\n");
        let len = 13;

        let mut stream = TableStream::open("t", file.path(), &range(0, len), true, '\t', 4096).unwrap();
        let first = stream.next_record().unwrap().unwrap();
        assert_eq!(first.fields, vec!["a", "1"]);
        assert_eq!(first.offset, 5);

        // Range starting at the second data line
        let mut stream = TableStream::open("t", file.path(), &range(9, len), true, '\t', 4096).unwrap();
        let record = stream.next_record().unwrap().unwrap();
        assert_eq!(record.fields, vec!["b", "2"]);
        assert!(stream.next_record().unwrap().is_none());
        assert_eq!(stream.records(), 1);
    }

    #[test]
    fn test_range_end_stops_stream() {
        let file = table_file("a\nb\nc\n");
        let mut stream = TableStream::open("t", file.path(), &range(0, 4), false, '\t', 4096).unwrap();

        assert_eq!(stream.next_record().unwrap().unwrap().fields, vec!["a"]);
        assert_eq!(stream.next_record().unwrap().unwrap().fields, vec!["b"]);
        assert!(stream.next_record().unwrap().is_none());
        assert_eq!(stream.percent_read(), 100.0);
    }

    #[test]
    fn test_empty_lines_and_crlf() {
        let file = table_file("a\r\n\r\n\nb\r\n");
        let mut stream = TableStream::open("t", file.path(), &range(0, 10), false, '\t', 4096).unwrap();

        assert_eq!(stream.next_record().unwrap().unwrap().fields, vec!["a"]);
        let b = stream.next_record().unwrap().unwrap();
        assert_eq!(b.fields, vec!["b"]);
        assert_eq!(b.offset, 6);
        assert!(stream.next_record().unwrap().is_none());
    }

    #[test]
    fn test_missing_trailing_newline() {
        let file = table_file("a\nb");
        let mut stream = TableStream::open("t", file.path(), &range(0, 3), false, '\t', 4096).unwrap();
        assert_eq!(stream.next_record().unwrap().unwrap().fields, vec!["a"]);
        assert_eq!(stream.next_record().unwrap().unwrap().fields, vec!["b"]);
        assert!(stream.next_record().unwrap().is_none());
    }

    #[test]
    fn test_open_aligned_moves_to_next_line() {
        let file = table_file("alpha\nbeta\ngamma\n");
        let mut reader = LineReader::open_aligned(file.path(), 2, 17, 4096).unwrap();
        assert_eq!(reader.next_line().unwrap(), Some(6));
        assert_eq!(reader.line(), b"beta");

        // Offset exactly on a line start stays there
        let mut reader = LineReader::open_aligned(file.path(), 6, 17, 4096).unwrap();
        assert_eq!(reader.next_line().unwrap(), Some(6));
    }
}
