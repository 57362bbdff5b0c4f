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

//! Per-partition hash index over build rows.
//!
//! Maps a key fingerprint to the chain of rows that produced it, in
//! insertion order. Fingerprints can collide, so probing returns candidate
//! chains and the caller re-checks actual key equality; duplicates stay as
//! separate chain entries because an N:M key match must emit N*M rows.

use std::collections::HashMap;

use ahash::RandomState;

/// Position of one build row: batch ordinal within the partition and row
/// ordinal within that batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    pub batch: u32,
    pub row: u32,
}

const EMPTY: &[RowRef] = &[];

#[derive(Debug, Default)]
pub struct HashIndex {
    map: HashMap<u64, Vec<RowRef>, RandomState>,
    rows: usize,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fingerprint: u64, row: RowRef) {
        self.map.entry(fingerprint).or_default().push(row);
        self.rows += 1;
    }

    /// Candidate rows for a fingerprint, in insertion order. Callers must
    /// verify key equality per candidate.
    pub fn probe(&self, fingerprint: u64) -> &[RowRef] {
        self.map.get(&fingerprint).map_or(EMPTY, Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Rough heap footprint, used for spill-victim sizing only.
    pub fn estimated_size(&self) -> usize {
        self.map.capacity() * (8 + std::mem::size_of::<Vec<RowRef>>())
            + self.rows * std::mem::size_of::<RowRef>()
    }
}
