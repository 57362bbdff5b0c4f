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

//! Row-at-a-time column builders.
//!
//! Builders gather rows out of existing columns when assembling output
//! batches and when replaying spilled partitions. They mirror the closed
//! encoding set one-to-one; appending from a column of a different encoding
//! is a caller bug and panics.

use crate::common::bit;
use crate::vector::{
    Column, DataType, FixedColumn, ListColumn, StructColumn, UnionColumn, VarlenColumn,
};

/// Builds one column by appending values row by row.
#[derive(Debug)]
pub enum ColumnBuilder {
    Fixed {
        width: usize,
        values: Vec<u8>,
        validity: Vec<u8>,
        len: usize,
    },
    Varlen {
        offsets: Vec<u32>,
        data: Vec<u8>,
        validity: Vec<u8>,
        len: usize,
    },
    List {
        offsets: Vec<u32>,
        child: Box<ColumnBuilder>,
        validity: Vec<u8>,
        len: usize,
    },
    Struct {
        children: Vec<ColumnBuilder>,
        validity: Vec<u8>,
        len: usize,
    },
    Union {
        type_ids: Vec<u8>,
        children: Vec<ColumnBuilder>,
        len: usize,
    },
    Null {
        len: usize,
    },
    Zero {
        len: usize,
    },
}

/// Appends one bit to a validity bitmap tracking `len` existing rows.
fn push_validity(validity: &mut Vec<u8>, len: usize, valid: bool) {
    if len % 8 == 0 {
        validity.push(0);
    }
    if valid {
        bit::set_bit(validity, len);
    }
}

impl ColumnBuilder {
    /// An empty builder for the given encoding.
    pub fn new(data_type: &DataType) -> Self {
        match data_type {
            DataType::Fixed { width } => ColumnBuilder::Fixed {
                width: *width,
                values: Vec::new(),
                validity: Vec::new(),
                len: 0,
            },
            DataType::Varlen => ColumnBuilder::Varlen {
                offsets: vec![0],
                data: Vec::new(),
                validity: Vec::new(),
                len: 0,
            },
            DataType::List(child) => ColumnBuilder::List {
                offsets: vec![0],
                child: Box::new(ColumnBuilder::new(child)),
                validity: Vec::new(),
                len: 0,
            },
            DataType::Struct(fields) => ColumnBuilder::Struct {
                children: fields.iter().map(ColumnBuilder::new).collect(),
                validity: Vec::new(),
                len: 0,
            },
            DataType::Union(variants) => ColumnBuilder::Union {
                type_ids: Vec::new(),
                children: variants.iter().map(ColumnBuilder::new).collect(),
                len: 0,
            },
            DataType::Null => ColumnBuilder::Null { len: 0 },
            DataType::Zero => ColumnBuilder::Zero { len: 0 },
        }
    }

    /// Number of rows appended so far.
    pub fn len(&self) -> usize {
        match self {
            ColumnBuilder::Fixed { len, .. }
            | ColumnBuilder::Varlen { len, .. }
            | ColumnBuilder::List { len, .. }
            | ColumnBuilder::Struct { len, .. }
            | ColumnBuilder::Union { len, .. }
            | ColumnBuilder::Null { len }
            | ColumnBuilder::Zero { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a null row.
    pub fn append_null(&mut self) {
        match self {
            ColumnBuilder::Fixed {
                width,
                values,
                validity,
                len,
            } => {
                values.resize(values.len() + *width, 0);
                push_validity(validity, *len, false);
                *len += 1;
            }
            ColumnBuilder::Varlen {
                offsets,
                data,
                validity,
                len,
            } => {
                offsets.push(data.len() as u32);
                push_validity(validity, *len, false);
                *len += 1;
            }
            ColumnBuilder::List {
                offsets,
                child,
                validity,
                len,
            } => {
                offsets.push(child.len() as u32);
                push_validity(validity, *len, false);
                *len += 1;
            }
            ColumnBuilder::Struct {
                children,
                validity,
                len,
            } => {
                // children stay full length so row ordinals keep lining up
                for c in children.iter_mut() {
                    c.append_null();
                }
                push_validity(validity, *len, false);
                *len += 1;
            }
            ColumnBuilder::Union {
                type_ids,
                children,
                len,
            } => {
                type_ids.push(0);
                for c in children.iter_mut() {
                    c.append_null();
                }
                *len += 1;
            }
            ColumnBuilder::Null { len } | ColumnBuilder::Zero { len } => *len += 1,
        }
    }

    /// Appends physical row `row` of `src`. The source encoding must match
    /// the builder's.
    pub fn append_from(&mut self, src: &Column, row: usize) {
        match (self, src) {
            (
                ColumnBuilder::Fixed {
                    width,
                    values,
                    validity,
                    len,
                },
                Column::Fixed(c),
            ) => {
                debug_assert_eq!(*width, c.width);
                if bit::get_bit(&c.validity, row) {
                    values.extend_from_slice(&c.values[row * c.width..(row + 1) * c.width]);
                    push_validity(validity, *len, true);
                } else {
                    values.resize(values.len() + *width, 0);
                    push_validity(validity, *len, false);
                }
                *len += 1;
            }
            (
                ColumnBuilder::Varlen {
                    offsets,
                    data,
                    validity,
                    len,
                },
                Column::Varlen(c),
            ) => {
                if bit::get_bit(&c.validity, row) {
                    let start = c.offsets[row] as usize;
                    let end = c.offsets[row + 1] as usize;
                    data.extend_from_slice(&c.data[start..end]);
                    push_validity(validity, *len, true);
                } else {
                    push_validity(validity, *len, false);
                }
                offsets.push(data.len() as u32);
                *len += 1;
            }
            (
                ColumnBuilder::List {
                    offsets,
                    child,
                    validity,
                    len,
                },
                Column::List(c),
            ) => {
                if bit::get_bit(&c.validity, row) {
                    let start = c.offsets[row] as usize;
                    let end = c.offsets[row + 1] as usize;
                    for elem in start..end {
                        child.append_from(&c.child, elem);
                    }
                    push_validity(validity, *len, true);
                } else {
                    push_validity(validity, *len, false);
                }
                offsets.push(child.len() as u32);
                *len += 1;
            }
            (
                ColumnBuilder::Struct {
                    children,
                    validity,
                    len,
                },
                Column::Struct(c),
            ) => {
                for (b, child) in children.iter_mut().zip(&c.children) {
                    b.append_from(child, row);
                }
                push_validity(validity, *len, bit::get_bit(&c.validity, row));
                *len += 1;
            }
            (
                ColumnBuilder::Union {
                    type_ids,
                    children,
                    len,
                },
                Column::Union(c),
            ) => {
                type_ids.push(c.type_ids[row]);
                for (b, child) in children.iter_mut().zip(&c.children) {
                    b.append_from(child, row);
                }
                *len += 1;
            }
            (ColumnBuilder::Null { len }, Column::Null { .. })
            | (ColumnBuilder::Zero { len }, Column::Zero { .. }) => *len += 1,
            _ => unreachable!("column encoding mismatch in append_from"),
        }
    }

    /// Finalizes the builder into a column.
    pub fn finish(self) -> Column {
        match self {
            ColumnBuilder::Fixed {
                width,
                values,
                validity,
                len,
            } => Column::Fixed(FixedColumn {
                width,
                values,
                validity,
                len,
            }),
            ColumnBuilder::Varlen {
                offsets,
                data,
                validity,
                len,
            } => Column::Varlen(VarlenColumn {
                offsets,
                data,
                validity,
                len,
            }),
            ColumnBuilder::List {
                offsets,
                child,
                validity,
                len,
            } => Column::List(ListColumn {
                offsets,
                child: Box::new(child.finish()),
                validity,
                len,
            }),
            ColumnBuilder::Struct {
                children,
                validity,
                len,
            } => Column::Struct(StructColumn {
                children: children.into_iter().map(ColumnBuilder::finish).collect(),
                validity,
                len,
            }),
            ColumnBuilder::Union {
                type_ids,
                children,
                len,
            } => Column::Union(UnionColumn {
                type_ids,
                children: children.into_iter().map(ColumnBuilder::finish).collect(),
                len,
            }),
            ColumnBuilder::Null { len } => Column::Null { len },
            ColumnBuilder::Zero { len } => Column::Zero { len },
        }
    }
}
