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

//! Minimal columnar batch representation.
//!
//! A batch is an ordered collection of equal-length columns, each using one
//! of a closed set of encodings, plus an optional selection list naming the
//! logically active rows. Upstream operators produce batches; this crate
//! only reads them, except for output batches it builds itself.
//!
//! Validity is a bitmap with one bit per row, set for non-null values, the
//! same layout the validity buffers use on disk.

use crate::common::bit;

pub mod builder;
pub mod hash;
pub mod sizer;

pub use builder::ColumnBuilder;

/// The closed set of column encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    /// Fixed-width values of `width` bytes per row.
    Fixed { width: usize },
    /// Variable-width byte strings behind an offset buffer.
    Varlen,
    /// Nested list: offsets into a child column holding the elements.
    List(Box<DataType>),
    /// Nested struct: one child column per field, all full length.
    Struct(Vec<DataType>),
    /// Sparse tagged union: a type-tag buffer plus one full-length sibling
    /// column per variant; the tag names the sibling owning each row.
    Union(Vec<DataType>),
    /// Every row is null; no buffers.
    Null,
    /// Rows carry no data at all (e.g. an empty struct).
    Zero,
}

/// A named column of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// An ordered list of fields describing one side of the join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, i: usize) -> &Field {
        &self.fields[i]
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fixed-width column: `len * width` value bytes plus a validity bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedColumn {
    pub width: usize,
    pub values: Vec<u8>,
    pub validity: Vec<u8>,
    pub len: usize,
}

/// Variable-width column: `len + 1` offsets into a shared data buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarlenColumn {
    pub offsets: Vec<u32>,
    pub data: Vec<u8>,
    pub validity: Vec<u8>,
    pub len: usize,
}

/// List column: `len + 1` offsets into a child column of elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListColumn {
    pub offsets: Vec<u32>,
    pub child: Box<Column>,
    pub validity: Vec<u8>,
    pub len: usize,
}

/// Struct column: full-length children plus a top-level validity bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructColumn {
    pub children: Vec<Column>,
    pub validity: Vec<u8>,
    pub len: usize,
}

/// Sparse tagged union: every sibling holds a slot for every row and
/// `type_ids[row]` names the sibling whose value is live. Nullability is
/// carried by the siblings; there is no top-level validity buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionColumn {
    pub type_ids: Vec<u8>,
    pub children: Vec<Column>,
    pub len: usize,
}

/// One column of a record batch; the tag selects the sizing and copying
/// strategy used throughout the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    Fixed(FixedColumn),
    Varlen(VarlenColumn),
    List(ListColumn),
    Struct(StructColumn),
    Union(UnionColumn),
    Null { len: usize },
    Zero { len: usize },
}

impl Column {
    /// Number of physical rows.
    pub fn len(&self) -> usize {
        match self {
            Column::Fixed(c) => c.len,
            Column::Varlen(c) => c.len,
            Column::List(c) => c.len,
            Column::Struct(c) => c.len,
            Column::Union(c) => c.len,
            Column::Null { len } | Column::Zero { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Column::Fixed(c) => DataType::Fixed { width: c.width },
            Column::Varlen(_) => DataType::Varlen,
            Column::List(c) => DataType::List(Box::new(c.child.data_type())),
            Column::Struct(c) => {
                DataType::Struct(c.children.iter().map(Column::data_type).collect())
            }
            Column::Union(c) => DataType::Union(c.children.iter().map(Column::data_type).collect()),
            Column::Null { .. } => DataType::Null,
            Column::Zero { .. } => DataType::Zero,
        }
    }

    /// Whether the value at `row` is null. Union columns delegate to the
    /// sibling named by the row's type tag.
    pub fn is_null(&self, row: usize) -> bool {
        match self {
            Column::Fixed(c) => !bit::get_bit(&c.validity, row),
            Column::Varlen(c) => !bit::get_bit(&c.validity, row),
            Column::List(c) => !bit::get_bit(&c.validity, row),
            Column::Struct(c) => !bit::get_bit(&c.validity, row),
            Column::Union(c) => c.children[c.type_ids[row] as usize].is_null(row),
            Column::Null { .. } => true,
            Column::Zero { .. } => false,
        }
    }

    /// Approximate heap bytes held by this column's buffers.
    pub fn memory_size(&self) -> usize {
        match self {
            Column::Fixed(c) => c.values.len() + c.validity.len(),
            Column::Varlen(c) => c.offsets.len() * 4 + c.data.len() + c.validity.len(),
            Column::List(c) => c.offsets.len() * 4 + c.validity.len() + c.child.memory_size(),
            Column::Struct(c) => {
                c.validity.len() + c.children.iter().map(Column::memory_size).sum::<usize>()
            }
            Column::Union(c) => {
                c.type_ids.len() + c.children.iter().map(Column::memory_size).sum::<usize>()
            }
            Column::Null { .. } | Column::Zero { .. } => 0,
        }
    }

    /// Builds a fixed-width 8-byte column from optional i64 values.
    pub fn fixed_i64(values: &[Option<i64>]) -> Column {
        let mut validity = vec![0u8; bit::ceil(values.len(), 8)];
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for (i, v) in values.iter().enumerate() {
            match v {
                Some(v) => {
                    bit::set_bit(&mut validity, i);
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                None => bytes.extend_from_slice(&[0u8; 8]),
            }
        }
        Column::Fixed(FixedColumn {
            width: 8,
            values: bytes,
            validity,
            len: values.len(),
        })
    }

    /// Builds a fixed-width 4-byte column from optional i32 values.
    pub fn fixed_i32(values: &[Option<i32>]) -> Column {
        let mut validity = vec![0u8; bit::ceil(values.len(), 8)];
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for (i, v) in values.iter().enumerate() {
            match v {
                Some(v) => {
                    bit::set_bit(&mut validity, i);
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                None => bytes.extend_from_slice(&[0u8; 4]),
            }
        }
        Column::Fixed(FixedColumn {
            width: 4,
            values: bytes,
            validity,
            len: values.len(),
        })
    }

    /// Builds a variable-width column from optional strings.
    pub fn varlen_utf8(values: &[Option<&str>]) -> Column {
        let mut validity = vec![0u8; bit::ceil(values.len(), 8)];
        let mut offsets = Vec::with_capacity(values.len() + 1);
        let mut data = Vec::new();
        offsets.push(0u32);
        for (i, v) in values.iter().enumerate() {
            if let Some(v) = v {
                bit::set_bit(&mut validity, i);
                data.extend_from_slice(v.as_bytes());
            }
            offsets.push(data.len() as u32);
        }
        Column::Varlen(VarlenColumn {
            offsets,
            data,
            validity,
            len: values.len(),
        })
    }

    /// Reads the i64 at `row` of a fixed-width 8-byte column. Test helper
    /// and key-extraction convenience; panics on other encodings.
    pub fn i64_at(&self, row: usize) -> Option<i64> {
        match self {
            Column::Fixed(c) if c.width == 8 => {
                if !bit::get_bit(&c.validity, row) {
                    return None;
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&c.values[row * 8..row * 8 + 8]);
                Some(i64::from_le_bytes(buf))
            }
            _ => panic!("i64_at on non 8-byte fixed column"),
        }
    }

    /// Reads the UTF-8 value at `row` of a variable-width column.
    pub fn utf8_at(&self, row: usize) -> Option<&str> {
        match self {
            Column::Varlen(c) => {
                if !bit::get_bit(&c.validity, row) {
                    return None;
                }
                let start = c.offsets[row] as usize;
                let end = c.offsets[row + 1] as usize;
                std::str::from_utf8(&c.data[start..end]).ok()
            }
            _ => panic!("utf8_at on non-varlen column"),
        }
    }
}

/// A record batch: equal-length columns plus an optional selection list.
#[derive(Debug, Clone)]
pub struct Batch {
    columns: Vec<Column>,
    num_rows: usize,
    selection: Option<Vec<u32>>,
}

impl Batch {
    /// Creates a batch, validating that all columns agree on length.
    pub fn try_new(columns: Vec<Column>) -> crate::errors::JoinResult<Self> {
        let num_rows = columns.first().map_or(0, Column::len);
        for (i, col) in columns.iter().enumerate() {
            if col.len() != num_rows {
                return Err(crate::errors::JoinError::Internal(format!(
                    "column {i} has {} rows, expected {num_rows}",
                    col.len()
                )));
            }
        }
        Ok(Self {
            columns,
            num_rows,
            selection: None,
        })
    }

    /// Attaches a selection list: a strictly increasing subset of row
    /// ordinals designating the logically active rows.
    pub fn with_selection(mut self, selection: Vec<u32>) -> crate::errors::JoinResult<Self> {
        let mut prev: Option<u32> = None;
        for &ordinal in &selection {
            if ordinal as usize >= self.num_rows || prev.is_some_and(|p| p >= ordinal) {
                return Err(crate::errors::JoinError::Internal(format!(
                    "invalid selection ordinal {ordinal} for batch of {} rows",
                    self.num_rows
                )));
            }
            prev = Some(ordinal);
        }
        self.selection = Some(selection);
        Ok(self)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, i: usize) -> &Column {
        &self.columns[i]
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Physical row count, ignoring the selection list.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn selection(&self) -> Option<&[u32]> {
        self.selection.as_deref()
    }

    /// Logical row count: selection length when present, else `num_rows`.
    pub fn selected_count(&self) -> usize {
        self.selection.as_ref().map_or(self.num_rows, Vec::len)
    }

    /// Maps logical row `i` to its physical ordinal.
    pub fn selected_ordinal(&self, i: usize) -> u32 {
        match &self.selection {
            Some(sel) => sel[i],
            None => i as u32,
        }
    }

    /// Approximate heap bytes held by this batch.
    pub fn memory_size(&self) -> usize {
        self.columns.iter().map(Column::memory_size).sum::<usize>()
            + self.selection.as_ref().map_or(0, |s| s.len() * 4)
    }

    /// Gathers physical rows `indices` into a new batch with no selection.
    pub fn take(&self, indices: &[u32]) -> Batch {
        let columns = self
            .columns
            .iter()
            .map(|col| {
                let mut b = ColumnBuilder::new(&col.data_type());
                for &row in indices {
                    b.append_from(col, row as usize);
                }
                b.finish()
            })
            .collect();
        Batch {
            columns,
            num_rows: indices.len(),
            selection: None,
        }
    }

    /// Concatenates the selected rows of `batches` into one batch.
    pub fn concat(batches: &[Batch]) -> crate::errors::JoinResult<Batch> {
        let first = batches.first().ok_or_else(|| {
            crate::errors::JoinError::Internal("concat of zero batches".to_string())
        })?;
        let types: Vec<DataType> = first.columns.iter().map(Column::data_type).collect();
        let mut builders: Vec<ColumnBuilder> = types.iter().map(ColumnBuilder::new).collect();
        let mut num_rows = 0usize;
        for batch in batches {
            for i in 0..batch.selected_count() {
                let row = batch.selected_ordinal(i) as usize;
                for (b, col) in builders.iter_mut().zip(&batch.columns) {
                    b.append_from(col, row);
                }
            }
            num_rows += batch.selected_count();
        }
        Ok(Batch {
            columns: builders.into_iter().map(ColumnBuilder::finish).collect(),
            num_rows,
            selection: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_rejects_ragged_columns() {
        let a = Column::fixed_i64(&[Some(1), Some(2)]);
        let b = Column::fixed_i64(&[Some(1)]);
        assert!(Batch::try_new(vec![a, b]).is_err());
    }

    #[test]
    fn selection_must_be_increasing_and_in_bounds() {
        let col = Column::fixed_i64(&[Some(1), Some(2), Some(3)]);
        let batch = Batch::try_new(vec![col.clone()]).unwrap();
        assert!(batch.clone().with_selection(vec![0, 2]).is_ok());
        let batch = Batch::try_new(vec![col.clone()]).unwrap();
        assert!(batch.with_selection(vec![2, 1]).is_err());
        let batch = Batch::try_new(vec![col]).unwrap();
        assert!(batch.with_selection(vec![3]).is_err());
    }

    #[test]
    fn selected_ordinals() {
        let col = Column::fixed_i64(&[Some(10), Some(20), Some(30), Some(40)]);
        let batch = Batch::try_new(vec![col])
            .unwrap()
            .with_selection(vec![1, 3])
            .unwrap();
        assert_eq!(batch.num_rows(), 4);
        assert_eq!(batch.selected_count(), 2);
        assert_eq!(batch.selected_ordinal(0), 1);
        assert_eq!(batch.selected_ordinal(1), 3);
    }

    #[test]
    fn take_gathers_rows() {
        let col = Column::fixed_i64(&[Some(10), None, Some(30)]);
        let batch = Batch::try_new(vec![col]).unwrap();
        let taken = batch.take(&[2, 0]);
        assert_eq!(taken.num_rows(), 2);
        assert_eq!(taken.column(0).i64_at(0), Some(30));
        assert_eq!(taken.column(0).i64_at(1), Some(10));
    }

    #[test]
    fn concat_honors_selection() {
        let a = Batch::try_new(vec![Column::fixed_i64(&[Some(1), Some(2), Some(3)])])
            .unwrap()
            .with_selection(vec![0, 2])
            .unwrap();
        let b = Batch::try_new(vec![Column::fixed_i64(&[Some(4)])]).unwrap();
        let merged = Batch::concat(&[a, b]).unwrap();
        assert_eq!(merged.num_rows(), 3);
        assert_eq!(merged.column(0).i64_at(0), Some(1));
        assert_eq!(merged.column(0).i64_at(1), Some(3));
        assert_eq!(merged.column(0).i64_at(2), Some(4));
    }

    #[test]
    fn union_null_follows_tagged_sibling() {
        let ints = Column::fixed_i64(&[Some(1), None, Some(3)]);
        let strs = Column::varlen_utf8(&[None, Some("b"), Some("c")]);
        let col = Column::Union(UnionColumn {
            type_ids: vec![0, 1, 1],
            children: vec![ints, strs],
            len: 3,
        });
        assert!(!col.is_null(0));
        assert!(!col.is_null(1));
        assert!(!col.is_null(2));
    }
}
