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

//! Key hashing and structural equality over columns.
//!
//! The same fingerprint drives both partition routing and the hash index,
//! so repartitioning a partition that overflowed must use a different seed
//! or every row would land back in one bucket. The seed is derived from the
//! recursion level.

use ahash::RandomState;

use crate::common::bit;
use crate::vector::Column;

/// Hash fed into the mix for a null value. An arbitrary odd constant; nulls
/// still need to route deterministically even though they never match.
const NULL_HASH: u64 = 0x9e37_79b9_7f4a_7c15;

/// Hash state for one recursion level. Level 0 is used for the initial
/// partitioning pass and the hash index; each deeper level reshuffles rows
/// that hashed together at every shallower level.
pub fn partition_random_state(recursion_level: usize) -> RandomState {
    RandomState::with_seeds(
        0x517c_c1b7_2722_0a95 ^ recursion_level as u64,
        0x6c62_272e_07bb_0142,
        0x5851_f42d_4c95_7f2d,
        0x1405_7b7e_f767_814f,
    )
}

/// Fingerprint of the key at physical `row` across `key_columns`.
pub fn hash_row(key_columns: &[&Column], row: usize, state: &RandomState) -> u64 {
    let mut acc = 0u64;
    for col in key_columns {
        acc = bit::mix_hash(acc, hash_value(col, row, state));
    }
    acc
}

fn hash_value(col: &Column, row: usize, state: &RandomState) -> u64 {
    if col.is_null(row) {
        return NULL_HASH;
    }
    match col {
        Column::Fixed(c) => state.hash_one(&c.values[row * c.width..(row + 1) * c.width]),
        Column::Varlen(c) => {
            let start = c.offsets[row] as usize;
            let end = c.offsets[row + 1] as usize;
            state.hash_one(&c.data[start..end])
        }
        Column::List(c) => {
            let start = c.offsets[row] as usize;
            let end = c.offsets[row + 1] as usize;
            let mut acc = state.hash_one((end - start) as u64);
            for elem in start..end {
                acc = bit::mix_hash(acc, hash_value(&c.child, elem, state));
            }
            acc
        }
        Column::Struct(c) => {
            let mut acc = 0u64;
            for child in &c.children {
                acc = bit::mix_hash(acc, hash_value(child, row, state));
            }
            acc
        }
        Column::Union(c) => {
            let tag = c.type_ids[row];
            bit::mix_hash(
                state.hash_one(tag),
                hash_value(&c.children[tag as usize], row, state),
            )
        }
        // is_null already handled Null; Zero rows all compare equal
        Column::Null { .. } | Column::Zero { .. } => NULL_HASH,
    }
}

/// Whether any key column is null at physical `row`. Null keys join nothing
/// under equality, so callers short-circuit them out of the index.
pub fn key_has_null(key_columns: &[&Column], row: usize) -> bool {
    key_columns.iter().any(|col| col.is_null(row))
}

/// Structural equality of two values, descending through nested encodings.
/// Nulls compare equal here; callers that need SQL semantics filter nulls
/// before comparing.
pub fn values_equal(a: &Column, a_row: usize, b: &Column, b_row: usize) -> bool {
    match (a.is_null(a_row), b.is_null(b_row)) {
        (true, true) => return true,
        (true, false) | (false, true) => return false,
        (false, false) => {}
    }
    match (a, b) {
        (Column::Fixed(a), Column::Fixed(b)) => {
            a.width == b.width
                && a.values[a_row * a.width..(a_row + 1) * a.width]
                    == b.values[b_row * b.width..(b_row + 1) * b.width]
        }
        (Column::Varlen(a), Column::Varlen(b)) => {
            let (a_start, a_end) = (a.offsets[a_row] as usize, a.offsets[a_row + 1] as usize);
            let (b_start, b_end) = (b.offsets[b_row] as usize, b.offsets[b_row + 1] as usize);
            a.data[a_start..a_end] == b.data[b_start..b_end]
        }
        (Column::List(a), Column::List(b)) => {
            let (a_start, a_end) = (a.offsets[a_row] as usize, a.offsets[a_row + 1] as usize);
            let (b_start, b_end) = (b.offsets[b_row] as usize, b.offsets[b_row + 1] as usize);
            a_end - a_start == b_end - b_start
                && (0..a_end - a_start)
                    .all(|i| values_equal(&a.child, a_start + i, &b.child, b_start + i))
        }
        (Column::Struct(a), Column::Struct(b)) => {
            a.children.len() == b.children.len()
                && a.children
                    .iter()
                    .zip(&b.children)
                    .all(|(ac, bc)| values_equal(ac, a_row, bc, b_row))
        }
        (Column::Union(a), Column::Union(b)) => {
            let (a_tag, b_tag) = (a.type_ids[a_row], b.type_ids[b_row]);
            a_tag == b_tag
                && values_equal(
                    &a.children[a_tag as usize],
                    a_row,
                    &b.children[b_tag as usize],
                    b_row,
                )
        }
        (Column::Zero { .. }, Column::Zero { .. }) => true,
        _ => false,
    }
}

/// Equality of whole keys at (`a_row`, `b_row`) across paired key columns.
pub fn keys_equal(a: &[&Column], a_row: usize, b: &[&Column], b_row: usize) -> bool {
    a.iter()
        .zip(b)
        .all(|(ac, bc)| values_equal(ac, a_row, bc, b_row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{ListColumn, UnionColumn};

    #[test]
    fn equal_keys_hash_equal() {
        let a = Column::fixed_i64(&[Some(42), Some(7)]);
        let b = Column::fixed_i64(&[Some(7), Some(42)]);
        let state = partition_random_state(0);
        assert_eq!(
            hash_row(&[&a], 0, &state),
            hash_row(&[&b], 1, &state),
            "same value must fingerprint the same across batches"
        );
        assert_ne!(hash_row(&[&a], 0, &state), hash_row(&[&a], 1, &state));
    }

    #[test]
    fn recursion_levels_reshuffle() {
        let col = Column::fixed_i64(&[Some(1), Some(2), Some(3), Some(4)]);
        let l0 = partition_random_state(0);
        let l1 = partition_random_state(1);
        let differs = (0..4).any(|row| hash_row(&[&col], row, &l0) != hash_row(&[&col], row, &l1));
        assert!(differs);
    }

    #[test]
    fn null_detection_over_composite_key() {
        let a = Column::fixed_i64(&[Some(1), None]);
        let b = Column::varlen_utf8(&[Some("x"), Some("y")]);
        assert!(!key_has_null(&[&a, &b], 0));
        assert!(key_has_null(&[&a, &b], 1));
    }

    #[test]
    fn varlen_equality_is_by_bytes() {
        let a = Column::varlen_utf8(&[Some("abc"), Some("")]);
        let b = Column::varlen_utf8(&[Some("abc"), Some("abd")]);
        assert!(values_equal(&a, 0, &b, 0));
        assert!(!values_equal(&a, 0, &b, 1));
        assert!(!values_equal(&a, 1, &b, 0));
    }

    #[test]
    fn list_equality_descends_into_elements() {
        let make = |vals: Vec<Option<i64>>, offsets: Vec<u32>, validity: Vec<u8>| {
            Column::List(ListColumn {
                len: offsets.len() - 1,
                offsets,
                child: Box::new(Column::fixed_i64(&vals)),
                validity,
            })
        };
        // a: [[1,2]], b: [[1,2], [1,3]]
        let a = make(vec![Some(1), Some(2)], vec![0, 2], vec![0b1]);
        let b = make(vec![Some(1), Some(2), Some(1), Some(3)], vec![0, 2, 4], vec![0b11]);
        assert!(values_equal(&a, 0, &b, 0));
        assert!(!values_equal(&a, 0, &b, 1));
        let state = partition_random_state(0);
        assert_eq!(hash_value(&a, 0, &state), hash_value(&b, 0, &state));
    }

    #[test]
    fn union_equality_requires_same_tag() {
        // row 0 tagged int 1, row 1 tagged string "1"
        let ints = Column::fixed_i64(&[Some(1), None]);
        let strs = Column::varlen_utf8(&[None, Some("1")]);
        let col = Column::Union(UnionColumn {
            type_ids: vec![0, 1],
            children: vec![ints, strs],
            len: 2,
        });
        assert!(values_equal(&col, 0, &col, 0));
        assert!(!values_equal(&col, 0, &col, 1));
    }
}
