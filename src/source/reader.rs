//! Batched CSV reader: many compressed remote files, one logical stream.
//!
//! Given an ordered list of per-day `.csv.gz` keys, yields a single
//! decompressed byte stream suitable for one bulk COPY: the first file's
//! header line (optionally with one column renamed to the canonical
//! staging name) followed by every file's body. Subsequent headers are
//! discarded. Each file's decoder and source bytes are dropped as soon as
//! its body is exhausted.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flate2::bufread::MultiGzDecoder;

use crate::emit;
use crate::error::ReaderError;
use crate::metrics::events::FileFetched;
use crate::source::FlatFileStore;

/// Decompressed bytes returned per `next_chunk` call.
const CHUNK_SIZE: usize = 64 * 1024;

type Decoder = BufReader<MultiGzDecoder<Cursor<Bytes>>>;

struct CurrentFile {
    key: String,
    decoder: Decoder,
}

/// Streams the concatenated decompressed contents of a batch of remote
/// compressed CSV files.
pub struct BatchedCsvReader {
    store: FlatFileStore,
    keys: VecDeque<String>,
    header_rename: Option<(&'static str, &'static str)>,
    fetch_timeout: Duration,
    target: &'static str,
    current: Option<CurrentFile>,
    header_emitted: bool,
    last_byte: u8,
    fetch_time: Duration,
}

impl BatchedCsvReader {
    pub fn new(
        store: FlatFileStore,
        keys: impl IntoIterator<Item = String>,
        header_rename: Option<(&'static str, &'static str)>,
        fetch_timeout: Duration,
        target: &'static str,
    ) -> Self {
        Self {
            store,
            keys: keys.into_iter().collect(),
            header_rename,
            fetch_timeout,
            target,
            current: None,
            header_emitted: false,
            last_byte: b'\n',
            fetch_time: Duration::ZERO,
        }
    }

    /// Cumulative time spent on remote fetches, excluding decompression.
    ///
    /// Separates network cost from database cost in diagnostics.
    pub fn fetch_time(&self) -> Duration {
        self.fetch_time
    }

    /// Next chunk of the combined stream, or `None` at end of the list.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ReaderError> {
        loop {
            if let Some(file) = &mut self.current {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let n = file
                    .decoder
                    .read(&mut buf)
                    .map_err(|source| ReaderError::CorruptStream {
                        key: file.key.clone(),
                        source,
                    })?;
                if n > 0 {
                    buf.truncate(n);
                    self.last_byte = buf[n - 1];
                    return Ok(Some(Bytes::from(buf)));
                }
                // Body exhausted: release the decoder and source bytes.
                self.current = None;
                if self.last_byte != b'\n' {
                    // A file without a trailing newline must not merge its
                    // last row into the next file's first row.
                    self.last_byte = b'\n';
                    return Ok(Some(Bytes::from_static(b"\n")));
                }
                continue;
            }

            let Some(key) = self.keys.pop_front() else {
                return Ok(None);
            };
            let header = self.open_file(key).await?;
            if !self.header_emitted {
                self.header_emitted = true;
                let header = self.rewrite_header(&header);
                self.last_byte = b'\n';
                return Ok(Some(Bytes::from(header)));
            }
            // Subsequent file: header discarded, continue into the body.
        }
    }

    /// Fetch and open one file, returning its header line.
    async fn open_file(&mut self, key: String) -> Result<String, ReaderError> {
        let start = Instant::now();
        let data = self
            .store
            .get(&key, self.fetch_timeout)
            .await
            .map_err(|source| ReaderError::Fetch {
                key: key.clone(),
                source,
            })?;
        let elapsed = start.elapsed();
        self.fetch_time += elapsed;
        emit!(FileFetched {
            bytes: data.len() as u64,
            duration: elapsed,
            target: self.target,
        });

        let mut decoder = BufReader::new(MultiGzDecoder::new(Cursor::new(data)));
        let mut header = String::new();
        let n = decoder
            .read_line(&mut header)
            .map_err(|source| ReaderError::CorruptStream {
                key: key.clone(),
                source,
            })?;
        if n == 0 {
            return Err(ReaderError::MissingHeader { key });
        }
        self.current = Some(CurrentFile { key, decoder });
        Ok(header)
    }

    /// Rewrite the known-mismatched column name to the canonical staging
    /// name, preserving the line ending.
    fn rewrite_header(&self, header: &str) -> String {
        let Some((from, to)) = self.header_rename else {
            return ensure_newline(header);
        };
        let trimmed = header.trim_end_matches(['\r', '\n']);
        let renamed: Vec<&str> = trimmed
            .split(',')
            .map(|column| if column == from { to } else { column })
            .collect();
        let mut line = renamed.join(",");
        line.push('\n');
        line
    }
}

fn ensure_newline(header: &str) -> String {
    let mut line = header.trim_end_matches(['\r', '\n']).to_string();
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::{ObjectStore, PutPayload};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    async fn store_with(files: &[(&str, Vec<u8>)]) -> FlatFileStore {
        let inner = InMemory::new();
        for (key, body) in files {
            inner
                .put(&Path::from(*key), PutPayload::from(body.clone()))
                .await
                .unwrap();
        }
        FlatFileStore::new(Arc::new(inner))
    }

    async fn drain(reader: &mut BatchedCsvReader) -> Result<String, ReaderError> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_single_file_passthrough() {
        let store = store_with(&[("a.csv.gz", gzip(b"ticker,window_start\nAAPL,1\n"))]).await;
        let mut reader = BatchedCsvReader::new(
            store,
            vec!["a.csv.gz".to_string()],
            None,
            Duration::from_secs(5),
            "1m",
        );
        let out = drain(&mut reader).await.unwrap();
        assert_eq!(out, "ticker,window_start\nAAPL,1\n");
    }

    #[tokio::test]
    async fn test_header_rename_applied() {
        let store = store_with(&[("a.csv.gz", gzip(b"ticker,window_start\nAAPL,1\n"))]).await;
        let mut reader = BatchedCsvReader::new(
            store,
            vec!["a.csv.gz".to_string()],
            Some(("window_start", "ts_ns")),
            Duration::from_secs(5),
            "1m",
        );
        let out = drain(&mut reader).await.unwrap();
        assert_eq!(out, "ticker,ts_ns\nAAPL,1\n");
    }

    #[tokio::test]
    async fn test_corrupt_stream_reported() {
        let mut truncated = gzip(b"ticker,window_start\nAAPL,1\nMSFT,2\n");
        truncated.truncate(truncated.len() / 2);
        let store = store_with(&[("bad.csv.gz", truncated)]).await;
        let mut reader = BatchedCsvReader::new(
            store,
            vec!["bad.csv.gz".to_string()],
            None,
            Duration::from_secs(5),
            "1m",
        );
        let err = drain(&mut reader).await.unwrap_err();
        assert!(matches!(err, ReaderError::CorruptStream { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_empty_file_missing_header() {
        let store = store_with(&[("empty.csv.gz", gzip(b""))]).await;
        let mut reader = BatchedCsvReader::new(
            store,
            vec!["empty.csv.gz".to_string()],
            None,
            Duration::from_secs(5),
            "1m",
        );
        let err = drain(&mut reader).await.unwrap_err();
        assert!(matches!(err, ReaderError::MissingHeader { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_trailing_newline_inserted() {
        let store = store_with(&[
            ("a.csv.gz", gzip(b"h\nrow1")),
            ("b.csv.gz", gzip(b"h\nrow2\n")),
        ])
        .await;
        let mut reader = BatchedCsvReader::new(
            store,
            vec!["a.csv.gz".to_string(), "b.csv.gz".to_string()],
            None,
            Duration::from_secs(5),
            "1m",
        );
        let out = drain(&mut reader).await.unwrap();
        assert_eq!(out, "h\nrow1\nrow2\n");
    }
}
