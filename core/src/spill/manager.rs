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

//! Spill policy and replay.
//!
//! Victim choice is largest-first with ties broken by partition id, so a
//! given memory state always spills the same partitions. Serialization is
//! one page per buffered batch; buffered batches are already bounded by the
//! operator's target batch size, which bounds page size in turn. Replay
//! coalesces small pages back into batches near the target row count so
//! downstream probing amortizes per-batch overhead.

use log::debug;

use crate::errors::JoinResult;
use crate::spill::page;
use crate::spill::store::{SpillFile, SpillFileReader};
use crate::vector::Batch;

/// Rows to aim for when coalescing replayed pages into batches.
pub const SPILL_READ_COALESCE_TARGET: usize = 8192;

/// Picks spill victims, largest-first, until the cumulative bytes meet
/// `target_bytes`. `candidates` pairs an id with its estimated resident
/// bytes; zero-byte candidates are never picked. Ties break toward the
/// smaller id for determinism.
pub fn choose_victims(candidates: &[(usize, usize)], target_bytes: usize) -> Vec<usize> {
    let mut sorted: Vec<(usize, usize)> = candidates
        .iter()
        .copied()
        .filter(|(_, bytes)| *bytes > 0)
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut victims = Vec::new();
    let mut freed = 0usize;
    for (id, bytes) in sorted {
        if freed >= target_bytes && !victims.is_empty() {
            break;
        }
        victims.push(id);
        freed += bytes;
    }
    victims
}

/// Serializes each batch's selected rows as one page into `file`. Returns
/// the page count written.
pub fn spill_batches(file: &mut SpillFile, batches: &[Batch]) -> JoinResult<usize> {
    for batch in batches {
        let encoded = page::encode_page(batch, 0, batch.selected_count())?;
        file.write_page(&encoded)?;
    }
    debug!(
        "spilled {} batches, {} bytes on disk so far",
        batches.len(),
        file.bytes_written()
    );
    Ok(batches.len())
}

/// Replays a finished spill file, coalescing consecutive pages into
/// batches of roughly `target_rows` rows.
pub struct ReplayStream {
    reader: SpillFileReader,
    target_rows: usize,
    done: bool,
}

impl ReplayStream {
    pub fn new(reader: SpillFileReader, target_rows: usize) -> Self {
        Self {
            reader,
            target_rows: target_rows.max(1),
            done: false,
        }
    }

    pub fn next_batch(&mut self) -> JoinResult<Option<Batch>> {
        if self.done {
            return Ok(None);
        }
        let mut collected: Vec<Batch> = Vec::new();
        let mut rows = 0usize;
        while rows < self.target_rows {
            match self.reader.next_batch()? {
                Some(b) => {
                    rows += b.num_rows();
                    collected.push(b);
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        match collected.len() {
            0 => Ok(None),
            1 => Ok(collected.pop()),
            _ => Batch::concat(&collected).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Column;

    #[test]
    fn victims_largest_first_ties_by_id() {
        let candidates = vec![(0, 100), (1, 300), (2, 300), (3, 50)];
        assert_eq!(choose_victims(&candidates, 1), vec![1]);
        assert_eq!(choose_victims(&candidates, 350), vec![1, 2]);
        assert_eq!(choose_victims(&candidates, 10_000), vec![1, 2, 0, 3]);
    }

    #[test]
    fn zero_sized_candidates_are_skipped() {
        assert!(choose_victims(&[(0, 0), (1, 0)], 100).is_empty());
        assert_eq!(choose_victims(&[(0, 0), (1, 10)], 100), vec![1]);
    }

    #[test]
    fn replay_coalesces_to_target() {
        let mut file = SpillFile::create().unwrap();
        let mut all = Vec::new();
        for chunk in 0..5 {
            let values: Vec<Option<i64>> = (0..10).map(|i| Some(chunk * 10 + i)).collect();
            all.extend(values.iter().copied());
            let b = Batch::try_new(vec![Column::fixed_i64(&values)]).unwrap();
            spill_batches(&mut file, std::slice::from_ref(&b)).unwrap();
        }
        let types = vec![crate::vector::DataType::Fixed { width: 8 }];
        file.finish(&types).unwrap();

        let mut replay = ReplayStream::new(file.into_reader().unwrap(), 25);
        let mut replayed = Vec::new();
        let mut batches = 0;
        while let Some(b) = replay.next_batch().unwrap() {
            batches += 1;
            for row in 0..b.num_rows() {
                replayed.push(b.column(0).i64_at(row));
            }
        }
        assert_eq!(batches, 2, "five 10-row pages should coalesce into two");
        assert_eq!(replayed, all);
    }
}
