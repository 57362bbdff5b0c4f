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

//! Two-phase sizing and copying of column rows into spill pages.
//!
//! Sizing is exact: [`ColumnSizer::compute_bits_needed`] returns precisely
//! the number of bits the matching [`Copier`] will write, so a page buffer
//! can be allocated once and filled in a single pass with no reallocation.
//! Sizing never allocates; row subsets are described by a replayable run
//! provider so nested encodings (list elements, union siblings) can be
//! walked any number of times without materializing ordinal vectors.
//!
//! On-page layout per column, each sub-buffer rounded up to a 64-bit
//! boundary (see [`bit::round_upto_64`]):
//!
//! - fixed-width: validity bitmap, then `rows * width` value bytes
//! - variable-width: validity, `rows` u32 end offsets (start implied by the
//!   previous end, first row starts at zero), then the value bytes
//! - list: validity, `rows` u32 element-end offsets, then the child column
//!   encoded for the gathered element rows
//! - struct: validity, then each child encoded for the same rows
//! - union: one type tag byte per row, then every sibling encoded for the
//!   same rows (siblings are full length)
//! - null-only / zero-width: nothing; the row count in the page header is
//!   sufficient
//!
//! End-only offsets make a zero-row subset size to exactly zero bits for
//! every encoding, so empty partitions need no special-casing anywhere.

use crate::common::bit;
use crate::errors::JoinResult;
use crate::spill::page::PageWriter;
use crate::vector::{Batch, Column};

/// A replayable enumeration of `(start, count)` runs of physical rows, in
/// increasing order. Implementations must emit the same runs every call.
pub type RunProvider<'a> = &'a dyn Fn(&mut dyn FnMut(usize, usize));

/// Deferred bulk copy into an allocated page. Produced by
/// [`ColumnSizer::get_copier`] after sizing, consumed exactly once.
pub type Copier<'a> = Box<dyn FnOnce(&mut PageWriter) -> JoinResult<()> + 'a>;

/// Total rows named by a run provider.
fn run_rows(runs: RunProvider<'_>) -> usize {
    let mut total = 0usize;
    runs(&mut |_, count| total += count);
    total
}

/// Total value bytes of a variable-width column over the given runs.
fn varlen_data_bytes(offsets: &[u32], runs: RunProvider<'_>) -> usize {
    let mut total = 0usize;
    runs(&mut |start, count| {
        total += (offsets[start + count] - offsets[start]) as usize;
    });
    total
}

fn size_bits(col: &Column, runs: RunProvider<'_>, rows: usize) -> u64 {
    let validity = bit::round_upto_64(rows as u64);
    match col {
        Column::Fixed(c) => validity + bit::round_upto_64((rows * c.width) as u64 * 8),
        Column::Varlen(c) => {
            validity
                + bit::round_upto_64(rows as u64 * 32)
                + bit::round_upto_64(varlen_data_bytes(&c.offsets, runs) as u64 * 8)
        }
        Column::List(c) => {
            let offsets = &c.offsets;
            let child_runs = |f: &mut dyn FnMut(usize, usize)| {
                runs(&mut |start, count| {
                    for row in start..start + count {
                        let elem_start = offsets[row] as usize;
                        let elem_end = offsets[row + 1] as usize;
                        if elem_end > elem_start {
                            f(elem_start, elem_end - elem_start);
                        }
                    }
                });
            };
            let child_rows = run_rows(&child_runs);
            validity
                + bit::round_upto_64(rows as u64 * 32)
                + size_bits(&c.child, &child_runs, child_rows)
        }
        Column::Struct(c) => {
            validity
                + c.children
                    .iter()
                    .map(|child| size_bits(child, runs, rows))
                    .sum::<u64>()
        }
        Column::Union(c) => {
            // tag buffer plus every sibling at full length; the tag decides
            // which sibling owns each row but sparse siblings still carry a
            // slot per row
            bit::round_upto_64(rows as u64 * 8)
                + c.children
                    .iter()
                    .map(|child| size_bits(child, runs, rows))
                    .sum::<u64>()
        }
        Column::Null { .. } | Column::Zero { .. } => 0,
    }
}

fn copy_into(col: &Column, runs: RunProvider<'_>, rows: usize, w: &mut PageWriter) -> JoinResult<()> {
    match col {
        Column::Fixed(c) => {
            let validity = w.alloc_padded(bit::ceil(rows, 8))?;
            let values = w.alloc_padded(rows * c.width)?;
            let mut i = 0usize;
            let mut pos = values;
            runs(&mut |start, count| {
                for row in start..start + count {
                    if bit::get_bit(&c.validity, row) {
                        w.set_bit(validity, i);
                    }
                    i += 1;
                }
                w.put_bytes(pos, &c.values[start * c.width..(start + count) * c.width]);
                pos += count * c.width;
            });
            Ok(())
        }
        Column::Varlen(c) => {
            let validity = w.alloc_padded(bit::ceil(rows, 8))?;
            let ends = w.alloc_padded(rows * 4)?;
            let data = w.alloc_padded(varlen_data_bytes(&c.offsets, runs))?;
            let mut i = 0usize;
            let mut pos = data;
            runs(&mut |start, count| {
                let run_start = c.offsets[start] as usize;
                let run_end = c.offsets[start + count] as usize;
                w.put_bytes(pos, &c.data[run_start..run_end]);
                pos += run_end - run_start;
                for row in start..start + count {
                    if bit::get_bit(&c.validity, row) {
                        w.set_bit(validity, i);
                    }
                    let rebased = (pos - data) - (run_end - c.offsets[row + 1] as usize);
                    w.put_u32(ends + i * 4, rebased as u32);
                    i += 1;
                }
            });
            Ok(())
        }
        Column::List(c) => {
            let offsets = &c.offsets;
            let validity = w.alloc_padded(bit::ceil(rows, 8))?;
            let ends = w.alloc_padded(rows * 4)?;
            let mut i = 0usize;
            let mut elems = 0usize;
            runs(&mut |start, count| {
                for row in start..start + count {
                    if bit::get_bit(&c.validity, row) {
                        w.set_bit(validity, i);
                    }
                    elems += (offsets[row + 1] - offsets[row]) as usize;
                    w.put_u32(ends + i * 4, elems as u32);
                    i += 1;
                }
            });
            let child_runs = |f: &mut dyn FnMut(usize, usize)| {
                runs(&mut |start, count| {
                    for row in start..start + count {
                        let elem_start = offsets[row] as usize;
                        let elem_end = offsets[row + 1] as usize;
                        if elem_end > elem_start {
                            f(elem_start, elem_end - elem_start);
                        }
                    }
                });
            };
            copy_into(&c.child, &child_runs, elems, w)
        }
        Column::Struct(c) => {
            let validity = w.alloc_padded(bit::ceil(rows, 8))?;
            let mut i = 0usize;
            runs(&mut |start, count| {
                for row in start..start + count {
                    if bit::get_bit(&c.validity, row) {
                        w.set_bit(validity, i);
                    }
                    i += 1;
                }
            });
            for child in &c.children {
                copy_into(child, runs, rows, w)?;
            }
            Ok(())
        }
        Column::Union(c) => {
            let tags = w.alloc_padded(rows)?;
            let mut i = 0usize;
            runs(&mut |start, count| {
                for row in start..start + count {
                    w.put_u8(tags + i, c.type_ids[row]);
                    i += 1;
                }
            });
            for child in &c.children {
                copy_into(child, runs, rows, w)?;
            }
            Ok(())
        }
        Column::Null { .. } | Column::Zero { .. } => Ok(()),
    }
}

/// Per-row value byte length, used for output-batch budgeting. Validity
/// bits are not counted; offsets count four bytes per level.
fn row_byte_len(col: &Column, row: usize) -> usize {
    match col {
        Column::Fixed(c) => c.width,
        Column::Varlen(c) => 4 + (c.offsets[row + 1] - c.offsets[row]) as usize,
        Column::List(c) => {
            let mut len = 4;
            for elem in c.offsets[row] as usize..c.offsets[row + 1] as usize {
                len += row_byte_len(&c.child, elem);
            }
            len
        }
        Column::Struct(c) => c.children.iter().map(|ch| row_byte_len(ch, row)).sum(),
        Column::Union(c) => 1 + row_byte_len(&c.children[c.type_ids[row] as usize], row),
        Column::Null { .. } | Column::Zero { .. } => 0,
    }
}

/// Sizes and copies row subsets of a single column. One strategy per
/// encoding, selected by exhaustive match on the column tag.
pub struct ColumnSizer<'a> {
    column: &'a Column,
}

impl<'a> ColumnSizer<'a> {
    pub fn new(column: &'a Column) -> Self {
        Self { column }
    }

    /// Exact bits needed to copy `count` rows of `selection`, starting at
    /// logical position `start`. Pure, allocation-free.
    pub fn compute_bits_needed(&self, selection: &[u32], start: usize, count: usize) -> u64 {
        let ordinals = &selection[start..start + count];
        let runs = |f: &mut dyn FnMut(usize, usize)| {
            for &ordinal in ordinals {
                f(ordinal as usize, 1);
            }
        };
        size_bits(self.column, &runs, count)
    }

    /// Exact bits needed for a contiguous run of `count` physical rows
    /// starting at `ordinal`.
    pub fn size_in_bits_from_ordinal(&self, ordinal: usize, count: usize) -> u64 {
        let runs = |f: &mut dyn FnMut(usize, usize)| {
            if count > 0 {
                f(ordinal, count);
            }
        };
        size_bits(self.column, &runs, count)
    }

    /// Adds this column's per-row value byte length for physical rows
    /// `0..accumulator.len()` into `accumulator`.
    pub fn accumulate_per_row_length(&self, accumulator: &mut [usize]) {
        for (row, acc) in accumulator.iter_mut().enumerate() {
            *acc += row_byte_len(self.column, row);
        }
    }

    /// A copier for `count` rows of `selection` starting at `start`. The
    /// destination page must have been sized with [`compute_bits_needed`]
    /// over the same arguments.
    ///
    /// [`compute_bits_needed`]: ColumnSizer::compute_bits_needed
    pub fn get_copier(&self, selection: &'a [u32], start: usize, count: usize) -> Copier<'a> {
        let column = self.column;
        let ordinals = &selection[start..start + count];
        Box::new(move |w| {
            let runs = |f: &mut dyn FnMut(usize, usize)| {
                for &ordinal in ordinals {
                    f(ordinal as usize, 1);
                }
            };
            copy_into(column, &runs, count, w)
        })
    }

    /// A copier for a contiguous run of physical rows.
    pub fn get_copier_from_ordinal(&self, ordinal: usize, count: usize) -> Copier<'a> {
        let column = self.column;
        Box::new(move |w| {
            let runs = |f: &mut dyn FnMut(usize, usize)| {
                if count > 0 {
                    f(ordinal, count);
                }
            };
            copy_into(column, &runs, count, w)
        })
    }
}

/// Sizes and copies whole records: the same contract as [`ColumnSizer`],
/// summed over an ordered list of columns, with copiers invoked in column
/// order so the page layout matches the header's column order.
pub struct CombinedSizer<'a> {
    sizers: Vec<ColumnSizer<'a>>,
}

impl<'a> CombinedSizer<'a> {
    pub fn new(columns: &'a [Column]) -> Self {
        Self {
            sizers: columns.iter().map(ColumnSizer::new).collect(),
        }
    }

    pub fn for_batch(batch: &'a Batch) -> Self {
        Self::new(batch.columns())
    }

    pub fn compute_bits_needed(&self, selection: &[u32], start: usize, count: usize) -> u64 {
        self.sizers
            .iter()
            .map(|s| s.compute_bits_needed(selection, start, count))
            .sum()
    }

    pub fn size_in_bits_from_ordinal(&self, ordinal: usize, count: usize) -> u64 {
        self.sizers
            .iter()
            .map(|s| s.size_in_bits_from_ordinal(ordinal, count))
            .sum()
    }

    pub fn accumulate_per_row_length(&self, accumulator: &mut [usize]) {
        for sizer in &self.sizers {
            sizer.accumulate_per_row_length(accumulator);
        }
    }

    pub fn get_copier(&self, selection: &'a [u32], start: usize, count: usize) -> Copier<'a> {
        let copiers: Vec<Copier<'a>> = self
            .sizers
            .iter()
            .map(|s| s.get_copier(selection, start, count))
            .collect();
        Box::new(move |w| {
            for copier in copiers {
                copier(w)?;
            }
            Ok(())
        })
    }

    pub fn get_copier_from_ordinal(&self, ordinal: usize, count: usize) -> Copier<'a> {
        let copiers: Vec<Copier<'a>> = self
            .sizers
            .iter()
            .map(|s| s.get_copier_from_ordinal(ordinal, count))
            .collect();
        Box::new(move |w| {
            for copier in copiers {
                copier(w)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{DataType, ListColumn, UnionColumn};

    #[test]
    fn fixed_width_sizes_exactly() {
        let col = Column::fixed_i64(&[Some(1), Some(2), Some(3)]);
        let sizer = ColumnSizer::new(&col);
        // validity: 3 bits -> 64; values: 3*64 bits -> 192
        assert_eq!(sizer.size_in_bits_from_ordinal(0, 3), 64 + 192);
        assert_eq!(sizer.compute_bits_needed(&[0, 2], 0, 2), 64 + 128);
    }

    #[test]
    fn zero_rows_size_to_zero() {
        let fixed = Column::fixed_i64(&[Some(1)]);
        let varlen = Column::varlen_utf8(&[Some("abc")]);
        for col in [&fixed, &varlen] {
            let sizer = ColumnSizer::new(col);
            assert_eq!(sizer.size_in_bits_from_ordinal(0, 0), 0);
            assert_eq!(sizer.compute_bits_needed(&[], 0, 0), 0);
        }
    }

    #[test]
    fn varlen_counts_only_selected_bytes() {
        let col = Column::varlen_utf8(&[Some("aaaa"), Some("bbbbbbbb"), Some("cc")]);
        let sizer = ColumnSizer::new(&col);
        // validity 64 + ends 64 + data: 4+2=6 bytes -> 64 bits
        assert_eq!(sizer.compute_bits_needed(&[0, 2], 0, 2), 64 + 64 + 64);
        // all three rows: validity 64, ends 96 bits -> 128, data 14 bytes -> 128
        assert_eq!(sizer.size_in_bits_from_ordinal(0, 3), 64 + 128 + 128);
    }

    #[test]
    fn list_recurses_into_selected_elements() {
        // rows: [0..3), [3..3), [3..7) over an 8-byte child
        let child = Column::fixed_i64(&(0..7).map(Some).collect::<Vec<_>>());
        let col = Column::List(ListColumn {
            offsets: vec![0, 3, 3, 7],
            child: Box::new(child),
            validity: vec![0b111],
            len: 3,
        });
        let sizer = ColumnSizer::new(&col);
        // selecting rows 0 and 1: 3 elements
        // parent: validity 64 + ends 64; child: validity 64 + 3*64=192
        assert_eq!(sizer.compute_bits_needed(&[0, 1], 0, 2), 128 + 64 + 192);
        // row 1 alone is an empty list: parent buffers only
        assert_eq!(sizer.size_in_bits_from_ordinal(1, 1), 128);
    }

    #[test]
    fn union_adds_tag_cost_and_all_siblings() {
        let ints = Column::fixed_i64(&[Some(1), None]);
        let strs = Column::varlen_utf8(&[None, Some("xy")]);
        let col = Column::Union(UnionColumn {
            type_ids: vec![0, 1],
            children: vec![ints, strs],
            len: 2,
        });
        let sizer = ColumnSizer::new(&col);
        // tags: 2 bytes -> 64; int sibling: 64 + 128; str sibling: 64 + 64 + 64
        assert_eq!(sizer.size_in_bits_from_ordinal(0, 2), 64 + 192 + 192);
    }

    #[test]
    fn combined_sums_columns() {
        let a = Column::fixed_i64(&[Some(1), Some(2)]);
        let b = Column::varlen_utf8(&[Some("x"), None]);
        let cols = vec![a, b];
        let combined = CombinedSizer::new(&cols);
        let expected: u64 = cols
            .iter()
            .map(|c| ColumnSizer::new(c).size_in_bits_from_ordinal(0, 2))
            .sum();
        assert_eq!(combined.size_in_bits_from_ordinal(0, 2), expected);
    }

    #[test]
    fn per_row_lengths_accumulate_across_columns() {
        let a = Column::fixed_i64(&[Some(1), Some(2)]);
        let b = Column::varlen_utf8(&[Some("xyz"), None]);
        let cols = vec![a, b];
        let combined = CombinedSizer::new(&cols);
        let mut acc = vec![0usize; 2];
        combined.accumulate_per_row_length(&mut acc);
        assert_eq!(acc, vec![8 + 4 + 3, 8 + 4]);
    }

    #[test]
    fn null_and_zero_width_cost_nothing() {
        for dt in [DataType::Null, DataType::Zero] {
            let mut b = crate::vector::ColumnBuilder::new(&dt);
            for _ in 0..10 {
                b.append_null();
            }
            let col = b.finish();
            let sizer = ColumnSizer::new(&col);
            assert_eq!(sizer.size_in_bits_from_ordinal(0, 10), 0);
        }
    }
}
