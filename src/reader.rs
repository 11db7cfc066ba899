//! Incremental line reader over the unread suffix of a file.
//!
//! A reader starts at a byte offset, hands out newline-terminated lines one at a
//! time, and tracks how far it got. Only terminated lines count as consumed: a
//! trailing fragment without `\n` is left for a later read once the writer
//! finishes it.

use crate::cursor::FileStamp;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tracing::{debug, warn};

pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;
const READ_BUFFER_BYTES: usize = 64 * 1024;

/// One complete line with its terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Absolute byte offset of the first byte of the line.
    pub offset: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(RawLine),
    /// A line longer than the configured bound. Its bytes were discarded but the
    /// read position moved past it.
    Oversized { offset: u64, length: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSummary {
    pub start_offset: u64,
    /// Absolute offset just past the last consumed line.
    pub end_offset: u64,
    pub lines: u64,
    pub oversized: u64,
    /// Bytes after `end_offset` that belong to an unterminated final line.
    pub pending_bytes: u64,
    pub reached_end: bool,
}

impl ReadSummary {
    pub fn bytes_consumed(&self) -> u64 {
        self.end_offset.saturating_sub(self.start_offset)
    }
}

pub struct IncrementalReader {
    path: PathBuf,
    reader: BufReader<File>,
    stamp: FileStamp,
    max_line_bytes: usize,
    start_offset: u64,
    position: u64,
    consumed: u64,
    line_buf: Vec<u8>,
    lines: u64,
    oversized: u64,
    exhausted: bool,
}

impl IncrementalReader {
    /// Open `path` positioned at the start of the file. The identity stamp is
    /// taken from the opened handle, so [`IncrementalReader::seek`] and every
    /// later read refer to the same file the stamp describes.
    pub async fn open(path: &Path, max_line_bytes: usize) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("failed to read metadata for {}", path.display()))?;
        let stamp = FileStamp::from_metadata(&metadata);

        debug!(path = %path.display(), size = stamp.size, "opened file for reading");

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::with_capacity(READ_BUFFER_BYTES, file),
            stamp,
            max_line_bytes: max_line_bytes.max(1),
            start_offset: 0,
            position: 0,
            consumed: 0,
            line_buf: Vec::new(),
            lines: 0,
            oversized: 0,
            exhausted: false,
        })
    }

    /// Move to `offset` before the first read. An offset past the end of the
    /// file means it was truncated or rotated, and reading restarts at 0.
    /// Returns the offset actually used.
    pub async fn seek(&mut self, offset: u64) -> Result<u64> {
        let offset = if offset > self.stamp.size {
            warn!(
                path = %self.path.display(),
                previous_offset = offset,
                current_size = self.stamp.size,
                "file shorter than recorded offset; reading from the beginning"
            );
            0
        } else {
            offset
        };

        self.reader
            .seek(SeekFrom::Start(offset))
            .await
            .with_context(|| {
                format!("failed to seek {} to offset {}", self.path.display(), offset)
            })?;

        self.start_offset = offset;
        self.position = offset;
        self.consumed = offset;
        self.line_buf.clear();
        self.lines = 0;
        self.oversized = 0;
        self.exhausted = false;
        Ok(offset)
    }

    pub fn stamp(&self) -> &FileStamp {
        &self.stamp
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Absolute offset just past the last fully consumed line.
    pub fn consumed_offset(&self) -> u64 {
        self.consumed
    }

    /// Next terminated line, or `None` once only an unterminated fragment (or
    /// nothing) remains.
    pub async fn next_line(&mut self) -> Result<Option<LineRead>> {
        if self.exhausted {
            return Ok(None);
        }

        let line_start = self.consumed;
        let mut line_len: u64 = 0;
        let mut overflow = false;
        self.line_buf.clear();

        loop {
            let available = self
                .reader
                .fill_buf()
                .await
                .with_context(|| format!("failed to read from {}", self.path.display()))?;

            if available.is_empty() {
                self.exhausted = true;
                if overflow {
                    // Already past the bound, so it can never become a valid line.
                    self.consumed = self.position;
                    self.oversized += 1;
                    return Ok(Some(LineRead::Oversized {
                        offset: line_start,
                        length: line_len,
                    }));
                }
                return Ok(None);
            }

            let newline = available.iter().position(|byte| *byte == b'\n');
            let segment_len = newline.unwrap_or(available.len());

            if !overflow {
                if self.line_buf.len() + segment_len > self.max_line_bytes {
                    overflow = true;
                    self.line_buf = Vec::new();
                } else {
                    self.line_buf.extend_from_slice(&available[..segment_len]);
                }
            }
            line_len += segment_len as u64;

            let step = match newline {
                Some(idx) => idx + 1,
                None => segment_len,
            };
            self.reader.consume(step);
            self.position += step as u64;

            if newline.is_some() {
                self.consumed = self.position;
                if overflow {
                    self.oversized += 1;
                    return Ok(Some(LineRead::Oversized {
                        offset: line_start,
                        length: line_len,
                    }));
                }
                self.lines += 1;
                return Ok(Some(LineRead::Line(RawLine {
                    offset: line_start,
                    bytes: std::mem::take(&mut self.line_buf),
                })));
            }
        }
    }

    /// Close the reader and report how far it got.
    pub fn finish(self) -> ReadSummary {
        ReadSummary {
            start_offset: self.start_offset,
            end_offset: self.consumed,
            lines: self.lines,
            oversized: self.oversized,
            pending_bytes: self.position.saturating_sub(self.consumed),
            reached_end: self.exhausted,
        }
    }
}
