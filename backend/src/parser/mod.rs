//! Streaming CSV row splitter.
//!
//! Turns a stream of byte chunks into CSV rows without buffering the whole
//! input. Each chunk is appended to a small carry-over buffer; everything up
//! to the last record boundary outside double quotes is parsed with the `csv`
//! crate and queued, the partial tail waits for the next chunk.
//!
//! Rows are pulled one at a time with [`RowStream::next_row`], so the caller
//! decides when more input is read.

use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::StreamError;

/// Chunk size used when reading files.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One parsed CSV row.
pub type Row = Vec<String>;

/// Where the boundary scanner is inside the current field.
///
/// A `"` only opens a quoted field as the first byte of a field; anywhere
/// else it is data, as the `csv` crate reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldState {
    Start,
    Unquoted,
    Quoted,
    /// A `"` inside a quoted field: either an escaped quote or the end.
    QuoteInQuoted,
}

impl FieldState {
    /// Next state after `byte`, and whether `byte` ends a record.
    fn step(self, byte: u8) -> (Self, bool) {
        use FieldState::*;

        match (self, byte) {
            (Quoted, b'"') => (QuoteInQuoted, false),
            (Quoted, _) => (Quoted, false),
            (Start, b'"') | (QuoteInQuoted, b'"') => (Quoted, false),
            (_, b'\n') => (Start, true),
            (_, b',' | b'\r') => (Start, false),
            _ => (Unquoted, false),
        }
    }
}

/// Pull-based CSV row reader over a byte-chunk stream.
pub struct RowStream<S> {
    source: Pin<Box<S>>,
    /// Bytes of the record currently being received.
    buffer: Vec<u8>,
    /// How much of `buffer` has been scanned for boundaries.
    scanned: usize,
    field: FieldState,
    bom_checked: bool,
    exhausted: bool,
    received_bytes: bool,
    rows: VecDeque<Row>,
    /// Error hit after the rows currently queued.
    pending_error: Option<StreamError>,
    /// Rows parsed so far (queued or yielded).
    parsed: usize,
    /// Rows handed to the caller so far.
    yielded: usize,
}

impl<S, B> RowStream<S>
where
    S: Stream<Item = io::Result<B>>,
    B: AsRef<[u8]>,
{
    pub fn new(source: S) -> Self {
        Self {
            source: Box::pin(source),
            buffer: Vec::new(),
            scanned: 0,
            field: FieldState::Start,
            bom_checked: false,
            exhausted: false,
            received_bytes: false,
            rows: VecDeque::new(),
            pending_error: None,
            parsed: 0,
            yielded: 0,
        }
    }

    /// Next row, or `None` at end of input.
    ///
    /// Only reads from the source when no parsed row is queued.
    pub async fn next_row(&mut self) -> Result<Option<Row>, StreamError> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                self.yielded += 1;
                return Ok(Some(row));
            }
            if let Some(err) = self.pending_error.take() {
                self.exhausted = true;
                return Err(err);
            }
            if self.exhausted {
                return Ok(None);
            }
            self.pull().await?;
        }
    }

    /// Wait until the first non-empty chunk arrives or the input ends.
    /// Returns whether any byte was received.
    pub async fn wait_for_data(&mut self) -> Result<bool, StreamError> {
        while !self.received_bytes && !self.exhausted {
            self.pull().await?;
        }
        Ok(self.received_bytes)
    }

    async fn pull(&mut self) -> Result<(), StreamError> {
        match self.source.next().await {
            Some(Ok(chunk)) => self.push_chunk(chunk.as_ref()),
            Some(Err(e)) => {
                self.exhausted = true;
                return Err(StreamError::Aborted(e));
            }
            None => self.finish(),
        }
        Ok(())
    }

    /// Whether any byte has been received from the source yet.
    pub fn has_received_bytes(&self) -> bool {
        self.received_bytes
    }

    /// 1-based number of the last row returned (the header is row 1).
    pub fn row_number(&self) -> usize {
        self.yielded
    }

    fn push_chunk(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.received_bytes = true;
        self.buffer.extend_from_slice(chunk);

        if !self.bom_checked {
            if self.buffer.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&self.buffer) {
                return;
            }
            self.strip_bom();
        }

        let mut boundary = None;
        for (i, &byte) in self.buffer.iter().enumerate().skip(self.scanned) {
            let (next, ends_record) = self.field.step(byte);
            self.field = next;
            if ends_record {
                boundary = Some(i + 1);
            }
        }
        self.scanned = self.buffer.len();

        if let Some(end) = boundary {
            let complete: Vec<u8> = self.buffer.drain(..end).collect();
            self.scanned -= end;
            self.parse(&complete);
        }
    }

    fn finish(&mut self) {
        self.exhausted = true;
        if !self.bom_checked {
            self.strip_bom();
        }
        if self.buffer.is_empty() {
            return;
        }

        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        self.parse(&rest);
        if self.field == FieldState::Quoted && self.pending_error.is_none() {
            self.pending_error = Some(StreamError::Csv {
                row: self.parsed,
                message: "unterminated quoted field at end of input".to_string(),
            });
        }
    }

    fn strip_bom(&mut self) {
        self.bom_checked = true;
        if self.buffer.starts_with(UTF8_BOM) {
            self.buffer.drain(..UTF8_BOM.len());
        }
    }

    fn parse(&mut self, bytes: &[u8]) {
        if self.pending_error.is_some() {
            return;
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);
        let mut record = csv::ByteRecord::new();

        loop {
            let row = self.parsed + 1;
            match reader.read_byte_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.pending_error = Some(StreamError::Csv {
                        row,
                        message: e.to_string(),
                    });
                    break;
                }
            }

            let cells = record
                .iter()
                .map(|cell| std::str::from_utf8(cell).map(str::to_owned))
                .collect::<Result<Row, _>>();
            match cells {
                Ok(cells) => {
                    self.parsed += 1;
                    self.rows.push_back(cells);
                }
                Err(_) => {
                    self.pending_error = Some(StreamError::Encoding { row });
                    break;
                }
            }
        }
    }
}

/// Read a file as a stream of chunks of at most `chunk_size` bytes.
pub fn file_chunks(file: File, chunk_size: usize) -> impl Stream<Item = io::Result<Vec<u8>>> + Send {
    let chunk_size = chunk_size.max(1);
    stream::unfold(Some(file), move |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; chunk_size];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Split in-memory bytes into a chunk stream.
pub fn bytes_chunks(
    data: impl AsRef<[u8]>,
    chunk_size: usize,
) -> impl Stream<Item = io::Result<Vec<u8>>> + Send {
    let chunks: Vec<io::Result<Vec<u8>>> = data
        .as_ref()
        .chunks(chunk_size.max(1))
        .map(|c| Ok(c.to_vec()))
        .collect();
    stream::iter(chunks)
}
