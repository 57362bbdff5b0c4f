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

//! Self-describing spill pages.
//!
//! A page is one contiguous buffer holding a header followed by the column
//! sub-buffers laid out by the sizer/copier framework:
//!
//! ```text
//! [row_count: u32][column_count: u32][encoding descriptor per column]
//! [pad to 8 bytes]
//! [column 0 sub-buffers][column 1 sub-buffers]...
//! ```
//!
//! Every sub-buffer starts on an 8-byte boundary. A page is independently
//! decodable with no cross-page pointers, and a zero-row page acts as the
//! terminal marker of a partition's page sequence. Decode validates the
//! header, offset monotonicity, union tags and the final cursor position;
//! any mismatch is a [`JoinError::CorruptPage`], never skipped, because a
//! spilled page is the only copy of its rows.

use crate::common::bit;
use crate::common::PageBuffer;
use crate::errors::{JoinError, JoinResult};
use crate::vector::sizer::CombinedSizer;
use crate::vector::{
    Batch, Column, DataType, FixedColumn, ListColumn, StructColumn, UnionColumn, VarlenColumn,
};

const TAG_NULL: u8 = 0;
const TAG_ZERO: u8 = 1;
const TAG_FIXED: u8 = 2;
const TAG_VARLEN: u8 = 3;
const TAG_LIST: u8 = 4;
const TAG_STRUCT: u8 = 5;
const TAG_UNION: u8 = 6;

/// Sequential page writer. Offsets returned by [`alloc_padded`] are
/// absolute; `put_*` writes must stay inside regions allocated up front,
/// which the exact sizing contract guarantees.
///
/// [`alloc_padded`]: PageWriter::alloc_padded
pub struct PageWriter {
    buf: PageBuffer,
    pos: usize,
}

impl PageWriter {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: PageBuffer::new(bytes),
            pos: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Claims a zero-filled region of `len` bytes and advances the cursor
    /// to the next 8-byte boundary past it.
    pub fn alloc_padded(&mut self, len: usize) -> JoinResult<usize> {
        let start = self.pos;
        let end = start + bit::padded_len(len);
        if end > self.buf.capacity() {
            return Err(JoinError::Internal(format!(
                "page overflow: need {end} bytes, capacity {}",
                self.buf.capacity()
            )));
        }
        self.pos = end;
        Ok(start)
    }

    /// Appends raw bytes at the cursor with no padding (header fields).
    pub fn push_bytes(&mut self, bytes: &[u8]) -> JoinResult<()> {
        if self.pos + bytes.len() > self.buf.capacity() {
            return Err(JoinError::Internal("page overflow in header".to_string()));
        }
        self.buf.as_slice_mut()[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn push_u32(&mut self, v: u32) -> JoinResult<()> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn push_u8(&mut self, v: u8) -> JoinResult<()> {
        self.push_bytes(&[v])
    }

    /// Advances the cursor to the next 8-byte boundary.
    pub fn pad_to_8(&mut self) {
        self.pos = bit::padded_len(self.pos);
    }

    pub fn put_bytes(&mut self, at: usize, bytes: &[u8]) {
        self.buf.as_slice_mut()[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn put_u32(&mut self, at: usize, v: u32) {
        self.put_bytes(at, &v.to_le_bytes());
    }

    pub fn put_u8(&mut self, at: usize, v: u8) {
        self.buf.as_slice_mut()[at] = v;
    }

    /// Sets bit `i` of the bitmap starting at absolute offset `region`.
    pub fn set_bit(&mut self, region: usize, i: usize) {
        bit::set_bit(&mut self.buf.as_slice_mut()[region..], i);
    }

    /// Finalizes the page, truncated to the (8-byte aligned) cursor.
    pub fn finish(mut self) -> Vec<u8> {
        self.pad_to_8();
        let len = self.pos;
        self.buf.into_vec(len)
    }
}

/// Sequential page reader over a decoded page buffer.
struct PageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PageReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u32(&mut self) -> JoinResult<u32> {
        if self.pos + 4 > self.buf.len() {
            return Err(JoinError::CorruptPage("truncated header".to_string()));
        }
        let mut v = [0u8; 4];
        v.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(v))
    }

    fn read_u8(&mut self) -> JoinResult<u8> {
        if self.pos >= self.buf.len() {
            return Err(JoinError::CorruptPage("truncated header".to_string()));
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Reads `len` bytes and advances the cursor to the next 8-byte
    /// boundary past them.
    fn take_padded(&mut self, len: usize) -> JoinResult<&'a [u8]> {
        let end = self.pos + bit::padded_len(len);
        if end > self.buf.len() {
            return Err(JoinError::CorruptPage(format!(
                "truncated sub-buffer: need {end} bytes of {}",
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos = end;
        Ok(out)
    }

    fn align_to_8(&mut self) {
        self.pos = bit::padded_len(self.pos).min(self.buf.len());
    }

    fn exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn descriptor_len(dt: &DataType) -> usize {
    match dt {
        DataType::Null | DataType::Zero | DataType::Varlen => 1,
        DataType::Fixed { .. } => 5,
        DataType::List(child) => 1 + descriptor_len(child),
        DataType::Struct(children) | DataType::Union(children) => {
            5 + children.iter().map(descriptor_len).sum::<usize>()
        }
    }
}

fn write_descriptor(w: &mut PageWriter, dt: &DataType) -> JoinResult<()> {
    match dt {
        DataType::Null => w.push_u8(TAG_NULL),
        DataType::Zero => w.push_u8(TAG_ZERO),
        DataType::Fixed { width } => {
            w.push_u8(TAG_FIXED)?;
            w.push_u32(*width as u32)
        }
        DataType::Varlen => w.push_u8(TAG_VARLEN),
        DataType::List(child) => {
            w.push_u8(TAG_LIST)?;
            write_descriptor(w, child)
        }
        DataType::Struct(children) => {
            w.push_u8(TAG_STRUCT)?;
            w.push_u32(children.len() as u32)?;
            children.iter().try_for_each(|c| write_descriptor(w, c))
        }
        DataType::Union(children) => {
            w.push_u8(TAG_UNION)?;
            w.push_u32(children.len() as u32)?;
            children.iter().try_for_each(|c| write_descriptor(w, c))
        }
    }
}

fn read_descriptor(r: &mut PageReader<'_>) -> JoinResult<DataType> {
    match r.read_u8()? {
        TAG_NULL => Ok(DataType::Null),
        TAG_ZERO => Ok(DataType::Zero),
        TAG_FIXED => Ok(DataType::Fixed {
            width: r.read_u32()? as usize,
        }),
        TAG_VARLEN => Ok(DataType::Varlen),
        TAG_LIST => Ok(DataType::List(Box::new(read_descriptor(r)?))),
        TAG_STRUCT => {
            let n = r.read_u32()? as usize;
            (0..n)
                .map(|_| read_descriptor(r))
                .collect::<JoinResult<Vec<_>>>()
                .map(DataType::Struct)
        }
        TAG_UNION => {
            let n = r.read_u32()? as usize;
            (0..n)
                .map(|_| read_descriptor(r))
                .collect::<JoinResult<Vec<_>>>()
                .map(DataType::Union)
        }
        tag => Err(JoinError::CorruptPage(format!(
            "unknown column encoding tag {tag}"
        ))),
    }
}

fn header_len(types: &[DataType]) -> usize {
    bit::padded_len(8 + types.iter().map(descriptor_len).sum::<usize>())
}

/// Encodes `count` logical rows of `batch` starting at logical `start`
/// into one page. Logical rows honor the batch's selection list.
pub fn encode_page(batch: &Batch, start: usize, count: usize) -> JoinResult<Vec<u8>> {
    let types: Vec<DataType> = batch.columns().iter().map(Column::data_type).collect();
    let sizer = CombinedSizer::for_batch(batch);
    let (data_bits, copier) = match batch.selection() {
        Some(sel) => (
            sizer.compute_bits_needed(sel, start, count),
            sizer.get_copier(sel, start, count),
        ),
        None => (
            sizer.size_in_bits_from_ordinal(start, count),
            sizer.get_copier_from_ordinal(start, count),
        ),
    };
    let expected = header_len(&types) + (data_bits / 8) as usize;
    let mut w = PageWriter::with_capacity(expected);
    w.push_u32(count as u32)?;
    w.push_u32(types.len() as u32)?;
    for dt in &types {
        write_descriptor(&mut w, dt)?;
    }
    w.pad_to_8();
    copier(&mut w)?;
    if w.position() != expected {
        return Err(JoinError::Internal(format!(
            "page sizing mismatch: sized {expected} bytes, wrote {}",
            w.position()
        )));
    }
    Ok(w.finish())
}

/// Encodes a zero-row page carrying only the column descriptors. Marks the
/// end of a partition's page sequence.
pub fn encode_terminal_page(types: &[DataType]) -> JoinResult<Vec<u8>> {
    let mut w = PageWriter::with_capacity(header_len(types));
    w.push_u32(0)?;
    w.push_u32(types.len() as u32)?;
    for dt in types {
        write_descriptor(&mut w, dt)?;
    }
    Ok(w.finish())
}

fn read_validity(r: &mut PageReader<'_>, rows: usize) -> JoinResult<Vec<u8>> {
    Ok(r.take_padded(bit::ceil(rows, 8))?.to_vec())
}

/// Reads `rows` u32 end offsets and rebuilds the `rows + 1` offset buffer.
fn read_offsets(r: &mut PageReader<'_>, rows: usize) -> JoinResult<Vec<u32>> {
    let raw = r.take_padded(rows * 4)?;
    let mut offsets = Vec::with_capacity(rows + 1);
    offsets.push(0u32);
    let mut prev = 0u32;
    for i in 0..rows {
        let mut v = [0u8; 4];
        v.copy_from_slice(&raw[i * 4..i * 4 + 4]);
        let end = u32::from_le_bytes(v);
        if end < prev {
            return Err(JoinError::CorruptPage(format!(
                "offset buffer not monotonic at row {i}: {end} < {prev}"
            )));
        }
        offsets.push(end);
        prev = end;
    }
    Ok(offsets)
}

fn decode_column(dt: &DataType, rows: usize, r: &mut PageReader<'_>) -> JoinResult<Column> {
    match dt {
        DataType::Fixed { width } => {
            let validity = read_validity(r, rows)?;
            let values = r.take_padded(rows * width)?.to_vec();
            Ok(Column::Fixed(FixedColumn {
                width: *width,
                values,
                validity,
                len: rows,
            }))
        }
        DataType::Varlen => {
            let validity = read_validity(r, rows)?;
            let offsets = read_offsets(r, rows)?;
            let data_len = *offsets.last().unwrap_or(&0) as usize;
            let data = r.take_padded(data_len)?.to_vec();
            Ok(Column::Varlen(VarlenColumn {
                offsets,
                data,
                validity,
                len: rows,
            }))
        }
        DataType::List(child_dt) => {
            let validity = read_validity(r, rows)?;
            let offsets = read_offsets(r, rows)?;
            let child_rows = *offsets.last().unwrap_or(&0) as usize;
            let child = decode_column(child_dt, child_rows, r)?;
            Ok(Column::List(ListColumn {
                offsets,
                child: Box::new(child),
                validity,
                len: rows,
            }))
        }
        DataType::Struct(child_types) => {
            let validity = read_validity(r, rows)?;
            let children = child_types
                .iter()
                .map(|c| decode_column(c, rows, r))
                .collect::<JoinResult<Vec<_>>>()?;
            Ok(Column::Struct(StructColumn {
                children,
                validity,
                len: rows,
            }))
        }
        DataType::Union(child_types) => {
            let type_ids = r.take_padded(rows)?.to_vec();
            if let Some(&bad) = type_ids.iter().find(|t| **t as usize >= child_types.len()) {
                return Err(JoinError::CorruptPage(format!(
                    "union tag {bad} out of range for {} siblings",
                    child_types.len()
                )));
            }
            let children = child_types
                .iter()
                .map(|c| decode_column(c, rows, r))
                .collect::<JoinResult<Vec<_>>>()?;
            Ok(Column::Union(UnionColumn {
                type_ids,
                children,
                len: rows,
            }))
        }
        DataType::Null => Ok(Column::Null { len: rows }),
        DataType::Zero => Ok(Column::Zero { len: rows }),
    }
}

/// Decodes a page back into a batch (no selection list; spilled pages hold
/// only selected rows). A zero-row batch is the terminal marker.
pub fn decode_page(bytes: &[u8]) -> JoinResult<Batch> {
    let mut r = PageReader::new(bytes);
    let rows = r.read_u32()? as usize;
    let col_count = r.read_u32()? as usize;
    let types = (0..col_count)
        .map(|_| read_descriptor(&mut r))
        .collect::<JoinResult<Vec<_>>>()?;
    r.align_to_8();
    let mut columns = Vec::with_capacity(col_count);
    for dt in &types {
        columns.push(decode_column(dt, rows, &mut r)?);
    }
    if !r.exhausted() {
        return Err(JoinError::CorruptPage(format!(
            "{} trailing bytes after last column",
            bytes.len() - r.pos
        )));
    }
    Batch::try_new(columns)
}
