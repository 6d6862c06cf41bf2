//! Bounded-memory source readers
//!
//! [`StreamReader`] serves record-aligned byte chunks of a binary file.
//! [`TextChunkReader`] serves batches of rows of a delimited text file and
//! is used when the input is CSV instead of binary records.

use crate::chunk::{align_from, Chunk, ChunkIter, ChunkPlan};
use csv::ByteRecord;
use hetl_common::{EtlError, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Positional reader over the aligned chunks of a binary file
#[derive(Debug, Clone)]
pub struct StreamReader {
    path: PathBuf,
    file_size: u64,
    plan: ChunkPlan,
}

impl StreamReader {
    /// Stat `path` and plan its chunks
    ///
    /// The file is not kept open: every read opens its own handle, so
    /// chunks can be read concurrently and a failed read leaves no shared
    /// state behind.
    pub fn open(
        path: impl AsRef<Path>,
        record_size: usize,
        chunk_size: u64,
        base_offset: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| EtlError::read(&path, e))?;
        if !metadata.is_file() {
            return Err(EtlError::read(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let file_size = metadata.len();
        let plan = align_from(base_offset, file_size, record_size, chunk_size)?;

        debug!(
            path = %path.display(),
            file_size,
            chunks = plan.len(),
            tail_bytes = plan.tail_bytes(),
            "Planned binary source"
        );

        Ok(Self {
            path,
            file_size,
            plan,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// Read exactly the bytes of one chunk
    pub fn read_chunk(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path).map_err(|e| EtlError::read(&self.path, e))?;
        read_range(&mut file, chunk).map_err(|e| EtlError::read(&self.path, e))
    }
}

fn read_range<R: Read + Seek>(source: &mut R, chunk: &Chunk) -> std::io::Result<Vec<u8>> {
    source.seek(SeekFrom::Start(chunk.start))?;
    let mut buf = vec![0u8; chunk.len() as usize];
    source.read_exact(&mut buf)?;
    Ok(buf)
}

impl IntoIterator for StreamReader {
    type Item = Result<(Chunk, Vec<u8>)>;
    type IntoIter = ChunkStream;

    fn into_iter(self) -> ChunkStream {
        ChunkStream {
            chunks: self.plan.chunks(),
            path: self.path,
            file: None,
        }
    }
}

/// Sequential pass over a [`StreamReader`]'s chunks
///
/// The file is opened on the first call to `next`. Each item is read
/// independently, so a failed chunk is yielded as an error and the pass
/// continues with the next one.
pub struct ChunkStream {
    chunks: ChunkIter,
    path: PathBuf,
    file: Option<BufReader<File>>,
}

impl Iterator for ChunkStream {
    type Item = Result<(Chunk, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;

        if self.file.is_none() {
            match File::open(&self.path) {
                Ok(f) => self.file = Some(BufReader::new(f)),
                Err(e) => return Some(Err(EtlError::read(&self.path, e))),
            }
        }

        let file = self.file.as_mut()?;
        Some(
            read_range(file, &chunk)
                .map(|bytes| (chunk, bytes))
                .map_err(|e| EtlError::read(&self.path, e)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

/// Row-batch reader for delimited text input with a header row
pub struct TextChunkReader {
    reader: csv::Reader<File>,
    path: PathBuf,
    headers: Vec<String>,
    rows_per_chunk: usize,
    next_index: usize,
    next_row: u64,
    done: bool,
}

impl TextChunkReader {
    /// Open a delimited file and read its header row
    pub fn open(path: impl AsRef<Path>, delimiter: u8, rows_per_chunk: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| EtlError::read(&path, e.into()))?;

        let headers = reader
            .byte_headers()
            .map_err(|e| EtlError::read(&path, e.into()))?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_string())
            .collect();

        Ok(Self {
            reader,
            path,
            headers,
            rows_per_chunk: rows_per_chunk.max(1),
            next_index: 0,
            next_row: 0,
            done: false,
        })
    }

    /// Rows per batch that keep a text chunk within the binary chunk budget
    pub fn rows_for_budget(chunk_size: u64, record_size: usize) -> usize {
        (chunk_size / record_size.max(1) as u64).max(1) as usize
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for TextChunkReader {
    type Item = Result<(Chunk, Vec<ByteRecord>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut rows = Vec::with_capacity(self.rows_per_chunk.min(4096));
        while rows.len() < self.rows_per_chunk {
            let mut row = ByteRecord::new();
            match self.reader.read_byte_record(&mut row) {
                Ok(true) => rows.push(row),
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    // Row boundaries past a failed read cannot be recovered
                    self.done = true;
                    return Some(Err(EtlError::read(&self.path, e.into())));
                }
            }
        }

        if rows.is_empty() {
            return None;
        }

        let chunk = Chunk {
            index: self.next_index,
            start: self.next_row,
            end: self.next_row + rows.len() as u64,
        };
        self.next_index += 1;
        self.next_row = chunk.end;
        Some(Ok((chunk, rows)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn binary_file(records: usize, record_size: usize, extra: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..records * record_size + extra)
            .map(|i| (i % 251) as u8)
            .collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_into_iter_covers_region_in_order() {
        let file = binary_file(100, 16, 5);
        let reader = StreamReader::open(file.path(), 16, 64, 0).unwrap();
        assert_eq!(reader.file_size(), 1605);

        let chunks: Vec<_> = reader.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks.len(), 25);
        let joined: Vec<u8> = chunks.iter().flat_map(|(_, b)| b.clone()).collect();
        let expected: Vec<u8> = (0..1600).map(|i| (i % 251) as u8).collect();
        assert_eq!(joined, expected);
    }

    #[test]
    fn test_reopening_reproduces_sequence() {
        let file = binary_file(37, 10, 0);
        let first: Vec<_> = StreamReader::open(file.path(), 10, 30, 0)
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        let second: Vec<_> = StreamReader::open(file.path(), 10, 30, 0)
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_read_chunk_is_positional() {
        let file = binary_file(10, 8, 0);
        let reader = StreamReader::open(file.path(), 8, 16, 0).unwrap();
        let third = reader.plan().chunks().nth(2).unwrap();
        let bytes = reader.read_chunk(&third).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 32);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = StreamReader::open("/no/such/input.bin", 8, 64, 0).unwrap_err();
        assert_eq!(err.kind(), "io_read");
    }

    #[test]
    fn test_text_reader_batches_rows() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "id,product").unwrap();
        for i in 0..7 {
            writeln!(file, "{i},p{i}").unwrap();
        }
        file.flush().unwrap();

        let reader = TextChunkReader::open(file.path(), b',', 3).unwrap();
        assert_eq!(reader.headers(), &["id".to_string(), "product".to_string()]);

        let batches: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].0, Chunk { index: 0, start: 0, end: 3 });
        assert_eq!(batches[2].0, Chunk { index: 2, start: 6, end: 7 });
        assert_eq!(&batches[2].1[0][1], b"p6");
    }

    #[test]
    fn test_rows_for_budget_is_at_least_one() {
        assert_eq!(TextChunkReader::rows_for_budget(256, 64), 4);
        assert_eq!(TextChunkReader::rows_for_budget(10, 64), 1);
    }
}
