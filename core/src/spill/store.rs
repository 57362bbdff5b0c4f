// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Spill file storage.
//!
//! Each spilled partition side owns one anonymous temporary file holding a
//! sequence of length-prefixed pages, closed by a zero-row terminal page.
//! The file is deleted by the OS when the handle drops, so operator close
//! needs no explicit cleanup pass. A file missing its terminal page is an
//! incomplete spill and replaying it is a corruption error.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use crate::errors::{JoinError, JoinResult};
use crate::spill::page;
use crate::vector::{Batch, DataType};

/// Spill reads and writes go through large buffers; pages are small
/// relative to seek cost.
pub const SPILL_IO_BUFFER_SIZE: usize = 1024 * 1024;

/// Write half of a partition's spill file.
pub struct SpillFile {
    writer: BufWriter<File>,
    pages_written: usize,
    bytes_written: u64,
    finished: bool,
}

impl SpillFile {
    pub fn create() -> JoinResult<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self {
            writer: BufWriter::with_capacity(SPILL_IO_BUFFER_SIZE, file),
            pages_written: 0,
            bytes_written: 0,
            finished: false,
        })
    }

    /// Appends one encoded page. Pages become durable only once the
    /// terminal page is written by [`finish`](SpillFile::finish).
    pub fn write_page(&mut self, page: &[u8]) -> JoinResult<()> {
        debug_assert!(!self.finished);
        self.writer.write_all(&(page.len() as u64).to_le_bytes())?;
        self.writer.write_all(page)?;
        self.pages_written += 1;
        self.bytes_written += 8 + page.len() as u64;
        Ok(())
    }

    /// Writes the terminal page and flushes. After this the sequence is
    /// complete and the file may be replayed.
    pub fn finish(&mut self, types: &[DataType]) -> JoinResult<()> {
        if self.finished {
            return Ok(());
        }
        let terminal = page::encode_terminal_page(types)?;
        self.writer.write_all(&(terminal.len() as u64).to_le_bytes())?;
        self.writer.write_all(&terminal)?;
        self.writer.flush()?;
        self.bytes_written += 8 + terminal.len() as u64;
        self.finished = true;
        Ok(())
    }

    pub fn pages_written(&self) -> usize {
        self.pages_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Converts into a reader positioned at the first page. The spill must
    /// have been finished; replaying an unterminated file would risk
    /// silently dropping rows from a partial write.
    pub fn into_reader(self) -> JoinResult<SpillFileReader> {
        if !self.finished {
            return Err(JoinError::Internal(
                "replay of unfinished spill file".to_string(),
            ));
        }
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| JoinError::SpillIo {
                source: e.into_error(),
            })?;
        file.seek(SeekFrom::Start(0))?;
        Ok(SpillFileReader {
            reader: BufReader::with_capacity(SPILL_IO_BUFFER_SIZE, file),
            remaining: self.bytes_written,
            done: false,
        })
    }
}

/// Read half: a finite, forward-only page sequence, consumed exactly once.
pub struct SpillFileReader {
    reader: BufReader<File>,
    /// Bytes left in the file; bounds each page-length prefix so a corrupt
    /// prefix is rejected before it sizes an allocation.
    remaining: u64,
    done: bool,
}

impl SpillFileReader {
    /// Decodes the next page, or `None` once the terminal page is reached.
    /// Hitting end-of-file before the terminal page is corruption.
    pub fn next_batch(&mut self) -> JoinResult<Option<Batch>> {
        if self.done {
            return Ok(None);
        }
        let mut len_buf = [0u8; 8];
        if let Err(e) = self.reader.read_exact(&mut len_buf) {
            return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Err(JoinError::CorruptPage(
                    "spill file ended before terminal page".to_string(),
                ))
            } else {
                Err(e.into())
            };
        }
        self.remaining = self.remaining.saturating_sub(8);
        let len = u64::from_le_bytes(len_buf);
        if len > self.remaining {
            return Err(JoinError::CorruptPage(format!(
                "page length prefix {len} exceeds the {} bytes left in the file",
                self.remaining
            )));
        }
        self.remaining -= len;
        let len = len as usize;
        let mut page_buf = vec![0u8; len];
        self.reader.read_exact(&mut page_buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                JoinError::CorruptPage("truncated spill page body".to_string())
            } else {
                JoinError::from(e)
            }
        })?;
        let batch = page::decode_page(&page_buf)?;
        if batch.num_rows() == 0 {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Column;

    fn batch(values: &[Option<i64>]) -> Batch {
        Batch::try_new(vec![Column::fixed_i64(values)]).unwrap()
    }

    #[test]
    fn write_finish_replay() {
        let types = vec![DataType::Fixed { width: 8 }];
        let mut file = SpillFile::create().unwrap();
        for chunk in [&[Some(1), Some(2)][..], &[None, Some(4)][..]] {
            let b = batch(chunk);
            let page = page::encode_page(&b, 0, b.num_rows()).unwrap();
            file.write_page(&page).unwrap();
        }
        file.finish(&types).unwrap();
        assert_eq!(file.pages_written(), 2);

        let mut reader = file.into_reader().unwrap();
        let first = reader.next_batch().unwrap().unwrap();
        assert_eq!(first.column(0).i64_at(0), Some(1));
        let second = reader.next_batch().unwrap().unwrap();
        assert_eq!(second.column(0).i64_at(0), None);
        assert_eq!(second.column(0).i64_at(1), Some(4));
        assert!(reader.next_batch().unwrap().is_none());
        // forward-only: stays exhausted
        assert!(reader.next_batch().unwrap().is_none());
    }

    #[test]
    fn empty_sequence_is_just_the_terminal_page() {
        let types = vec![DataType::Varlen];
        let mut file = SpillFile::create().unwrap();
        file.finish(&types).unwrap();
        let mut reader = file.into_reader().unwrap();
        assert!(reader.next_batch().unwrap().is_none());
    }

    #[test]
    fn unfinished_file_cannot_be_replayed() {
        let file = SpillFile::create().unwrap();
        assert!(matches!(
            file.into_reader(),
            Err(JoinError::Internal(_))
        ));
    }

    #[test]
    fn oversized_length_prefix_is_corruption_not_an_allocation() {
        let b = batch(&[Some(1)]);
        let page_bytes = page::encode_page(&b, 0, 1).unwrap();
        let mut file = SpillFile::create().unwrap();
        file.write_page(&page_bytes).unwrap();
        // a prefix claiming far more bytes than the file holds
        file.writer.write_all(&u64::MAX.to_le_bytes()).unwrap();
        file.bytes_written += 8;
        file.finished = true;
        file.writer.flush().unwrap();
        let mut reader = file.into_reader().unwrap();
        let _ = reader.next_batch().unwrap().unwrap();
        assert!(matches!(
            reader.next_batch(),
            Err(JoinError::CorruptPage(_))
        ));
    }

    #[test]
    fn missing_terminal_page_is_corruption() {
        // write a page sequence but drop the terminal marker by writing the
        // raw bytes through a second, unfinished file
        let b = batch(&[Some(7)]);
        let page_bytes = page::encode_page(&b, 0, 1).unwrap();
        let mut file = SpillFile::create().unwrap();
        file.write_page(&page_bytes).unwrap();
        // bypass finish: mark finished without the terminal page
        file.finished = true;
        file.writer.flush().unwrap();
        let mut reader = file.into_reader().unwrap();
        let _ = reader.next_batch().unwrap().unwrap();
        assert!(matches!(
            reader.next_batch(),
            Err(JoinError::CorruptPage(_))
        ));
    }
}
