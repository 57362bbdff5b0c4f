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

//! Pull-based out-of-core hash join operator.
//!
//! The operator does no internal threading and never blocks: the external
//! scheduler polls [`HashJoinOperator::get_state`] and calls the matching
//! `consume_*` / `output_data` method, each of which does a bounded amount
//! of work. Build batches are partitioned by key hash and indexed in
//! memory; under memory pressure whole partitions move to spill files and
//! their probe rows are buffered until the drain phase replays them.
//!
//! A replayed partition is joined by a nested operator one recursion level
//! deeper. The deeper level reshuffles rows with a different hash seed, so
//! a partition that overflowed memory splits across fresh partitions
//! instead of collapsing into one again. Recursion is capped; at the cap
//! the operator refuses to spill and an allocation failure there surfaces
//! as a fatal out-of-memory error after the bounded retry.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::RandomState;
use log::debug;

use crate::common::bit;
use crate::errors::{JoinError, JoinResult};
use crate::join::hash_index::{HashIndex, RowRef};
use crate::join::metrics::JoinMetrics;
use crate::join::partition::{Partition, PartitionScratch};
use crate::join::{JoinType, OperatorState};
use crate::memory::{MemoryPool, MemoryReservation};
use crate::spill::manager::{self, ReplayStream};
use crate::spill::store::SpillFileReader;
use crate::vector::hash::{self, partition_random_state};
use crate::vector::{Batch, Column, ColumnBuilder, DataType, Field, Schema};

pub const DEFAULT_NUM_PARTITIONS: usize = 16;
pub const DEFAULT_TARGET_BATCH_SIZE: usize = 8192;

/// Deepest repartitioning level. An operator at this level keeps everything
/// resident; running out of memory there is fatal.
pub const MAX_RECURSION_DEPTH: usize = 3;

/// Reservation attempts per insert before resource exhaustion is fatal.
const MAX_RESERVE_RETRIES: usize = 3;

/// Extra predicate on a key-matched candidate pair: probe batch and row,
/// build batch and row. Pairs failing it count as non-matches.
pub type ResidualPredicate = Arc<dyn Fn(&Batch, usize, &Batch, usize) -> bool>;

/// Join plan parameters, provided by the planning collaborator.
#[derive(Clone)]
pub struct JoinConfig {
    pub join_type: JoinType,
    /// Key column indices into the probe schema, paired positionally with
    /// `build_keys`.
    pub probe_keys: Vec<usize>,
    pub build_keys: Vec<usize>,
    pub residual: Option<ResidualPredicate>,
    pub num_partitions: usize,
    pub target_batch_size: usize,
}

impl JoinConfig {
    pub fn new(join_type: JoinType, probe_keys: Vec<usize>, build_keys: Vec<usize>) -> Self {
        Self {
            join_type,
            probe_keys,
            build_keys,
            residual: None,
            num_partitions: DEFAULT_NUM_PARTITIONS,
            target_batch_size: DEFAULT_TARGET_BATCH_SIZE,
        }
    }

    pub fn with_residual(mut self, residual: ResidualPredicate) -> Self {
        self.residual = Some(residual);
        self
    }

    pub fn with_num_partitions(mut self, num_partitions: usize) -> Self {
        self.num_partitions = num_partitions.max(1);
        self
    }

    pub fn with_target_batch_size(mut self, rows: usize) -> Self {
        self.target_batch_size = rows.max(1);
        self
    }
}

enum Phase {
    Build,
    Probe,
    Drain,
    Finished,
}

/// Replay of one spilled partition through a nested operator one level
/// deeper.
struct ReplayJoin {
    inner: Box<HashJoinOperator>,
    build_reader: SpillFileReader,
    /// Matched bits per replayed build page, present when the partition was
    /// spilled after probing had begun.
    pre_matched: VecDeque<Option<Vec<u8>>>,
    probe_stream: Option<ReplayStream>,
    probe_pending: VecDeque<Batch>,
}

pub struct HashJoinOperator {
    config: JoinConfig,
    probe_schema: Schema,
    build_schema: Schema,
    output_schema: Schema,
    output_types: Vec<DataType>,
    probe_types: Vec<DataType>,
    build_types: Vec<DataType>,
    level: usize,
    pool: Arc<MemoryPool>,
    reservation: MemoryReservation,
    hash_state: RandomState,
    partitions: Vec<Partition>,
    scratch: PartitionScratch,
    pending_output: VecDeque<Batch>,
    out_builders: Vec<ColumnBuilder>,
    out_rows: usize,
    phase: Phase,
    drain_order: Vec<usize>,
    drain_cursor: usize,
    unmatched_cursor: (usize, usize),
    replay: Option<ReplayJoin>,
    metrics: JoinMetrics,
}

impl HashJoinOperator {
    /// Sets up an operator joining `probe_schema` against `build_schema`.
    /// The output schema is the probe fields followed by the build fields.
    pub fn try_new(
        config: JoinConfig,
        probe_schema: Schema,
        build_schema: Schema,
        pool: &Arc<MemoryPool>,
    ) -> JoinResult<Self> {
        Self::new_at_level(config, probe_schema, build_schema, pool, 0)
    }

    fn new_at_level(
        config: JoinConfig,
        probe_schema: Schema,
        build_schema: Schema,
        pool: &Arc<MemoryPool>,
        level: usize,
    ) -> JoinResult<Self> {
        if config.probe_keys.is_empty() || config.probe_keys.len() != config.build_keys.len() {
            return Err(JoinError::Internal(
                "probe and build key lists must be non-empty and pair up".to_string(),
            ));
        }
        for (&pk, &bk) in config.probe_keys.iter().zip(&config.build_keys) {
            if pk >= probe_schema.len() || bk >= build_schema.len() {
                return Err(JoinError::Internal(format!(
                    "key column pair ({pk}, {bk}) out of schema range"
                )));
            }
            let pt = &probe_schema.field(pk).data_type;
            let bt = &build_schema.field(bk).data_type;
            if pt != bt {
                return Err(JoinError::Internal(format!(
                    "key column pair ({pk}, {bk}) has mismatched encodings"
                )));
            }
        }
        let output_fields: Vec<Field> = probe_schema
            .fields()
            .iter()
            .chain(build_schema.fields())
            .cloned()
            .collect();
        let output_schema = Schema::new(output_fields);
        let output_types: Vec<DataType> = output_schema
            .fields()
            .iter()
            .map(|f| f.data_type.clone())
            .collect();
        let probe_types = probe_schema
            .fields()
            .iter()
            .map(|f| f.data_type.clone())
            .collect();
        let build_types = build_schema
            .fields()
            .iter()
            .map(|f| f.data_type.clone())
            .collect();
        let num_partitions = config.num_partitions.max(1);
        let out_builders = output_types.iter().map(ColumnBuilder::new).collect();
        Ok(Self {
            probe_schema,
            build_schema,
            output_schema,
            output_types,
            probe_types,
            build_types,
            level,
            pool: Arc::clone(pool),
            reservation: MemoryReservation::new(pool),
            hash_state: partition_random_state(level),
            partitions: (0..num_partitions).map(|_| Partition::default()).collect(),
            scratch: PartitionScratch::new(num_partitions),
            pending_output: VecDeque::new(),
            out_builders,
            out_rows: 0,
            phase: Phase::Build,
            drain_order: Vec::new(),
            drain_cursor: 0,
            unmatched_cursor: (0, 0),
            replay: None,
            metrics: JoinMetrics::default(),
            config,
        })
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    pub fn metrics(&self) -> &JoinMetrics {
        &self.metrics
    }

    pub fn get_state(&self) -> OperatorState {
        if !self.pending_output.is_empty() {
            return OperatorState::CanProduce;
        }
        match self.phase {
            Phase::Build => OperatorState::CanConsumeRight,
            Phase::Probe => OperatorState::CanConsumeLeft,
            Phase::Drain => OperatorState::CanProduce,
            Phase::Finished => OperatorState::Done,
        }
    }

    // ------------------------------------------------------------------
    // Build side
    // ------------------------------------------------------------------

    pub fn consume_data_right(&mut self, batch: &Batch) -> JoinResult<()> {
        self.consume_build_with_matched(batch, None)
    }

    /// Build-side consumption with optional pre-matched bits (one per
    /// physical row), used when replaying rows that matched before their
    /// partition was spilled.
    fn consume_build_with_matched(
        &mut self,
        batch: &Batch,
        pre_matched: Option<&[u8]>,
    ) -> JoinResult<()> {
        if !matches!(self.phase, Phase::Build) {
            return Err(JoinError::Internal(
                "build batch consumed outside CAN_CONSUME_RIGHT".to_string(),
            ));
        }
        let n = batch.selected_count();
        if n == 0 {
            return Ok(());
        }
        self.metrics.build_rows += n;
        self.scratch
            .partition(batch, &self.config.build_keys, &self.hash_state);

        let mut routed: Vec<(usize, Vec<u32>, Vec<u64>, Option<Vec<u8>>)> = Vec::new();
        for p in 0..self.partitions.len() {
            let rows = self.scratch.rows_for(p);
            if rows.is_empty() {
                continue;
            }
            let mut physical = Vec::with_capacity(rows.len());
            let mut fingerprints = Vec::with_capacity(rows.len());
            let mut bits = pre_matched.map(|_| vec![0u8; bit::ceil(rows.len(), 8)]);
            for (j, &i) in rows.iter().enumerate() {
                let phys = batch.selected_ordinal(i as usize);
                physical.push(phys);
                fingerprints.push(self.scratch.hash_at(i as usize));
                if let (Some(bits), Some(pre)) = (bits.as_mut(), pre_matched) {
                    if bit::get_bit(pre, phys as usize) {
                        bit::set_bit(bits, j);
                    }
                }
            }
            routed.push((p, physical, fingerprints, bits));
        }

        for (p, physical, fingerprints, bits) in routed {
            let sub = batch.take(&physical);
            if self.partitions[p].is_spilled() {
                self.write_build_page(p, &sub, bits)?;
                continue;
            }
            let bytes = sub.memory_size();
            self.reserve_or_spill(bytes)?;
            if self.partitions[p].is_spilled() {
                // the reservation retry spilled this very partition
                self.reservation.shrink(bytes);
                self.write_build_page(p, &sub, bits)?;
            } else {
                self.partitions[p].insert_build(sub, &fingerprints, bits.as_deref());
                self.partitions[p].build_reserved += bytes;
            }
        }
        Ok(())
    }

    fn write_build_page(
        &mut self,
        p: usize,
        sub: &Batch,
        pre_matched: Option<Vec<u8>>,
    ) -> JoinResult<()> {
        self.partitions[p].append_build_page(sub, pre_matched)?;
        self.metrics.spilled_pages += 1;
        Ok(())
    }

    pub fn no_more_to_consume_right(&mut self) -> JoinResult<()> {
        if !matches!(self.phase, Phase::Build) {
            return Err(JoinError::Internal(
                "build side already closed".to_string(),
            ));
        }
        let spilled = self.partitions.iter().filter(|p| p.is_spilled()).count();
        debug!(
            "build side complete (level {}): {} rows, {}/{} partitions spilled",
            self.level,
            self.metrics.build_rows,
            spilled,
            self.partitions.len()
        );
        self.phase = Phase::Probe;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Probe side
    // ------------------------------------------------------------------

    pub fn consume_data_left(&mut self, batch: &Batch) -> JoinResult<()> {
        if !matches!(self.phase, Phase::Probe) {
            return Err(JoinError::Internal(
                "probe batch consumed outside CAN_CONSUME_LEFT".to_string(),
            ));
        }
        let n = batch.selected_count();
        if n == 0 {
            return Ok(());
        }
        self.metrics.probe_rows += n;
        self.scratch
            .partition(batch, &self.config.probe_keys, &self.hash_state);

        let mut routed: Vec<(usize, Vec<(u32, u64)>)> = Vec::new();
        for p in 0..self.partitions.len() {
            let rows = self.scratch.rows_for(p);
            if rows.is_empty() {
                continue;
            }
            let rows = rows
                .iter()
                .map(|&i| {
                    (
                        batch.selected_ordinal(i as usize),
                        self.scratch.hash_at(i as usize),
                    )
                })
                .collect();
            routed.push((p, rows));
        }

        for (p, rows) in routed {
            // a partition can get spilled while earlier groups of this very
            // batch are processed, so the residency check happens here
            if self.partitions[p].is_spilled() {
                let physical: Vec<u32> = rows.iter().map(|r| r.0).collect();
                let sub = batch.take(&physical);
                let bytes = sub.memory_size();
                self.reserve_or_spill(bytes)?;
                self.partitions[p].probe_pending.push(sub);
                self.partitions[p].probe_reserved += bytes;
            } else {
                self.probe_resident(p, batch, &rows)?;
            }
        }
        Ok(())
    }

    /// Probes resident partition `p` with the given (physical row,
    /// fingerprint) pairs and queues matched output.
    fn probe_resident(&mut self, p: usize, batch: &Batch, rows: &[(u32, u64)]) -> JoinResult<()> {
        let residual = self.config.residual.clone();
        let mut matches: Vec<(u32, RowRef)> = Vec::new();
        let mut row_matched = vec![false; rows.len()];
        {
            let part = &self.partitions[p];
            let probe_key_cols: Vec<&Column> = self
                .config
                .probe_keys
                .iter()
                .map(|&c| batch.column(c))
                .collect();
            for (j, &(phys, fingerprint)) in rows.iter().enumerate() {
                // null keys join nothing under equality
                if hash::key_has_null(&probe_key_cols, phys as usize) {
                    continue;
                }
                for &candidate in part.index.probe(fingerprint) {
                    let build_batch = &part.build[candidate.batch as usize];
                    let build_key_cols: Vec<&Column> = self
                        .config
                        .build_keys
                        .iter()
                        .map(|&c| build_batch.column(c))
                        .collect();
                    if !hash::keys_equal(
                        &probe_key_cols,
                        phys as usize,
                        &build_key_cols,
                        candidate.row as usize,
                    ) {
                        continue;
                    }
                    if let Some(residual) = &residual {
                        if !residual(batch, phys as usize, build_batch, candidate.row as usize) {
                            continue;
                        }
                    }
                    matches.push((phys, candidate));
                    row_matched[j] = true;
                }
            }
        }
        for &(_, candidate) in &matches {
            self.partitions[p].mark_matched(candidate);
        }
        for &(phys, candidate) in &matches {
            self.emit_pair(batch, phys as usize, p, Some(candidate))?;
        }
        if self.config.join_type.emits_unmatched_probe() {
            for (j, matched) in row_matched.iter().enumerate() {
                if !matched {
                    self.emit_pair(batch, rows[j].0 as usize, p, None)?;
                }
            }
        }
        Ok(())
    }

    pub fn no_more_to_consume_left(&mut self) -> JoinResult<()> {
        if !matches!(self.phase, Phase::Probe) {
            return Err(JoinError::Internal(
                "probe side already closed".to_string(),
            ));
        }
        // drain resident partitions first so their memory is released
        // before any replay starts reserving
        let resident: Vec<usize> = (0..self.partitions.len())
            .filter(|&i| !self.partitions[i].is_spilled())
            .collect();
        let spilled: Vec<usize> = (0..self.partitions.len())
            .filter(|&i| self.partitions[i].is_spilled())
            .collect();
        self.drain_order = resident.into_iter().chain(spilled).collect();
        self.drain_cursor = 0;
        self.unmatched_cursor = (0, 0);
        self.phase = Phase::Drain;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    pub fn output_data(&mut self) -> JoinResult<Option<Batch>> {
        if let Some(batch) = self.pending_output.pop_front() {
            return Ok(Some(batch));
        }
        while matches!(self.phase, Phase::Drain) && self.pending_output.is_empty() {
            self.drain_step()?;
        }
        Ok(self.pending_output.pop_front())
    }

    fn drain_step(&mut self) -> JoinResult<()> {
        if self.drain_cursor >= self.drain_order.len() {
            self.flush_output()?;
            if self.pending_output.is_empty() {
                self.phase = Phase::Finished;
                self.metrics.log_summary(self.level);
            }
            return Ok(());
        }
        let p = self.drain_order[self.drain_cursor];
        if self.partitions[p].is_spilled() || self.replay.is_some() {
            if self.replay.is_none() {
                self.start_replay(p)?;
            }
            match self.drive_replay()? {
                Some(batch) => {
                    self.metrics.output_rows += batch.num_rows();
                    self.pending_output.push_back(batch);
                }
                None => {
                    self.replay = None;
                    self.retire_partition(p);
                    // the partition may have been spilled mid-unmatched-scan;
                    // the next resident partition starts a fresh scan
                    self.unmatched_cursor = (0, 0);
                    self.drain_cursor += 1;
                }
            }
            return Ok(());
        }
        if self.config.join_type.emits_unmatched_build() && !self.emit_unmatched_chunk(p)? {
            return Ok(());
        }
        self.retire_partition(p);
        self.unmatched_cursor = (0, 0);
        self.drain_cursor += 1;
        Ok(())
    }

    /// Emits up to a batch's worth of never-matched build rows from
    /// resident partition `p`. Returns whether the scan is complete.
    fn emit_unmatched_chunk(&mut self, p: usize) -> JoinResult<bool> {
        let (mut batch_idx, mut row) = self.unmatched_cursor;
        let mut emitted = 0usize;
        while batch_idx < self.partitions[p].build.len()
            && emitted < self.config.target_batch_size
        {
            if row >= self.partitions[p].build[batch_idx].num_rows() {
                batch_idx += 1;
                row = 0;
                continue;
            }
            let r = RowRef {
                batch: batch_idx as u32,
                row: row as u32,
            };
            if !self.partitions[p].is_matched(r) {
                self.emit_build_only(p, r)?;
                // a later spill of this partition must not hand the row to
                // replay as still-unmatched
                self.partitions[p].mark_matched(r);
                emitted += 1;
            }
            row += 1;
        }
        self.unmatched_cursor = (batch_idx, row);
        Ok(batch_idx >= self.partitions[p].build.len())
    }

    fn emit_pair(
        &mut self,
        probe: &Batch,
        probe_row: usize,
        partition: usize,
        build_ref: Option<RowRef>,
    ) -> JoinResult<()> {
        let probe_cols = self.probe_schema.len();
        {
            let Self {
                out_builders,
                partitions,
                ..
            } = self;
            for (c, builder) in out_builders.iter_mut().enumerate() {
                if c < probe_cols {
                    builder.append_from(probe.column(c), probe_row);
                } else {
                    match build_ref {
                        Some(r) => {
                            let src = &partitions[partition].build[r.batch as usize];
                            builder.append_from(src.column(c - probe_cols), r.row as usize);
                        }
                        None => builder.append_null(),
                    }
                }
            }
        }
        self.finish_output_row()
    }

    fn emit_build_only(&mut self, partition: usize, r: RowRef) -> JoinResult<()> {
        let probe_cols = self.probe_schema.len();
        {
            let Self {
                out_builders,
                partitions,
                ..
            } = self;
            let src = &partitions[partition].build[r.batch as usize];
            for (c, builder) in out_builders.iter_mut().enumerate() {
                if c < probe_cols {
                    builder.append_null();
                } else {
                    builder.append_from(src.column(c - probe_cols), r.row as usize);
                }
            }
        }
        self.finish_output_row()
    }

    fn finish_output_row(&mut self) -> JoinResult<()> {
        self.out_rows += 1;
        if self.out_rows >= self.config.target_batch_size {
            self.flush_output()?;
        }
        Ok(())
    }

    fn flush_output(&mut self) -> JoinResult<()> {
        if self.out_rows == 0 {
            return Ok(());
        }
        let builders = std::mem::take(&mut self.out_builders);
        let columns: Vec<Column> = builders.into_iter().map(ColumnBuilder::finish).collect();
        let batch = Batch::try_new(columns)?;
        self.metrics.output_rows += batch.num_rows();
        self.pending_output.push_back(batch);
        self.out_rows = 0;
        self.out_builders = self.output_types.iter().map(ColumnBuilder::new).collect();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    fn start_replay(&mut self, p: usize) -> JoinResult<()> {
        self.metrics.replayed_partitions += 1;
        let (spill, probe_spill, probe_pending, probe_reserved) = {
            let part = &mut self.partitions[p];
            (
                part.spill.take(),
                part.probe_spill.take(),
                std::mem::take(&mut part.probe_pending),
                std::mem::replace(&mut part.probe_reserved, 0),
            )
        };
        let Some(mut spill) = spill else {
            return Err(JoinError::Internal(format!(
                "replay of partition {p} which is not spilled"
            )));
        };
        self.reservation.shrink(probe_reserved);
        spill.file.finish(&self.build_types)?;
        let build_reader = spill.file.into_reader()?;
        let probe_stream = match probe_spill {
            Some(mut file) => {
                file.finish(&self.probe_types)?;
                Some(ReplayStream::new(
                    file.into_reader()?,
                    self.config.target_batch_size.min(manager::SPILL_READ_COALESCE_TARGET),
                ))
            }
            None => None,
        };
        debug!(
            "replaying partition {p} at level {}: {} build rows spilled",
            self.level, self.partitions[p].build_rows
        );
        let inner = HashJoinOperator::new_at_level(
            self.config.clone(),
            self.probe_schema.clone(),
            self.build_schema.clone(),
            &self.pool,
            self.level + 1,
        )?;
        self.replay = Some(ReplayJoin {
            inner: Box::new(inner),
            build_reader,
            pre_matched: spill.pre_matched.into(),
            probe_stream,
            probe_pending: probe_pending.into(),
        });
        Ok(())
    }

    /// Steps the nested replay operator until it yields an output batch or
    /// completes.
    fn drive_replay(&mut self) -> JoinResult<Option<Batch>> {
        let Some(replay) = self.replay.as_mut() else {
            return Err(JoinError::Internal(
                "drive_replay without an active replay".to_string(),
            ));
        };
        loop {
            match replay.inner.get_state() {
                OperatorState::CanConsumeRight => match replay.build_reader.next_batch()? {
                    Some(batch) => {
                        let pre = replay.pre_matched.pop_front().flatten();
                        replay
                            .inner
                            .consume_build_with_matched(&batch, pre.as_deref())?;
                    }
                    None => replay.inner.no_more_to_consume_right()?,
                },
                OperatorState::CanConsumeLeft => {
                    if let Some(stream) = replay.probe_stream.as_mut() {
                        match stream.next_batch()? {
                            Some(batch) => replay.inner.consume_data_left(&batch)?,
                            None => replay.probe_stream = None,
                        }
                        continue;
                    }
                    match replay.probe_pending.pop_front() {
                        Some(batch) => replay.inner.consume_data_left(&batch)?,
                        None => replay.inner.no_more_to_consume_left()?,
                    }
                }
                OperatorState::CanProduce => {
                    if let Some(batch) = replay.inner.output_data()? {
                        return Ok(Some(batch));
                    }
                }
                OperatorState::Done => return Ok(None),
            }
        }
    }

    fn retire_partition(&mut self, p: usize) {
        let part = &mut self.partitions[p];
        let held = part.build_reserved + part.probe_reserved;
        part.build_reserved = 0;
        part.probe_reserved = 0;
        part.build.clear();
        part.matched.clear();
        part.index = HashIndex::new();
        part.probe_pending.clear();
        part.retired = true;
        self.reservation.shrink(held);
    }

    // ------------------------------------------------------------------
    // Memory-shrink protocol
    // ------------------------------------------------------------------

    /// Bytes the operator could free by spilling, zero at the recursion
    /// cap.
    pub fn shrinkable_memory(&self) -> usize {
        if self.level >= MAX_RECURSION_DEPTH {
            return 0;
        }
        self.partitions
            .iter()
            .filter(|p| !p.retired)
            .map(|p| {
                let build = if p.is_spilled() {
                    0
                } else {
                    p.estimated_build_size()
                };
                build + p.estimated_probe_size()
            })
            .sum()
    }

    /// Attempts to free at least `bytes_hint` bytes by spilling victim
    /// partitions. A no-op returning `false` when nothing is spillable.
    pub fn shrink_memory(&mut self, bytes_hint: usize) -> JoinResult<bool> {
        if self.shrinkable_memory() == 0 {
            return Ok(false);
        }
        self.spill_victims(bytes_hint.max(1))
    }

    fn reserve_or_spill(&mut self, bytes: usize) -> JoinResult<()> {
        let mut attempts = 0;
        loop {
            match self.reservation.try_grow(bytes) {
                Ok(()) => return Ok(()),
                Err(JoinError::ResourcesExhausted(msg)) => {
                    attempts += 1;
                    if self.level >= MAX_RECURSION_DEPTH {
                        return Err(JoinError::ResourcesExhausted(format!(
                            "{msg} at repartition level {}; raise the memory \
                             ceiling or the partition count",
                            self.level
                        )));
                    }
                    if attempts > MAX_RESERVE_RETRIES || !self.spill_victims(bytes)? {
                        return Err(JoinError::ResourcesExhausted(msg));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Spills resident build sides and buffered probe rows, largest-first,
    /// until roughly `target_bytes` are freed. Returns whether anything was
    /// spilled.
    fn spill_victims(&mut self, target_bytes: usize) -> JoinResult<bool> {
        if self.level >= MAX_RECURSION_DEPTH {
            return Ok(false);
        }
        let num = self.partitions.len();
        let mut candidates = Vec::new();
        for (i, part) in self.partitions.iter().enumerate() {
            if part.retired {
                continue;
            }
            if !part.is_spilled() {
                let bytes = part.estimated_build_size();
                if bytes > 0 {
                    candidates.push((i, bytes));
                }
            }
            let bytes = part.estimated_probe_size();
            if bytes > 0 {
                candidates.push((num + i, bytes));
            }
        }
        let victims = manager::choose_victims(&candidates, target_bytes);
        if victims.is_empty() {
            return Ok(false);
        }
        for victim in victims {
            let (p, is_probe) = (victim % num, victim >= num);
            let pages = if is_probe {
                self.partitions[p].spill_probe()?
            } else {
                self.partitions[p].spill_build()?
            };
            let freed = if is_probe {
                std::mem::replace(&mut self.partitions[p].probe_reserved, 0)
            } else {
                std::mem::replace(&mut self.partitions[p].build_reserved, 0)
            };
            self.reservation.shrink(freed);
            self.metrics.spill_count += 1;
            self.metrics.spilled_pages += pages;
            self.metrics.spilled_bytes += freed as u64;
            debug!(
                "spilled {} of partition {p} at level {}: {pages} pages, ~{freed} bytes freed",
                if is_probe { "probe buffer" } else { "build side" },
                self.level,
            );
        }
        Ok(true)
    }

    /// Releases all partitions, buffered output and pool memory. Safe to
    /// call in any state, including mid-spill; spill files are deleted
    /// when their handles drop.
    pub fn close(&mut self) {
        self.partitions.clear();
        self.pending_output.clear();
        self.replay = None;
        self.out_builders.clear();
        self.out_rows = 0;
        self.drain_order.clear();
        self.reservation.free();
        self.phase = Phase::Finished;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Field;

    fn i64_schema(name: &str) -> Schema {
        Schema::new(vec![Field::new(name, DataType::Fixed { width: 8 })])
    }

    fn i64_batch(values: &[Option<i64>]) -> Batch {
        Batch::try_new(vec![Column::fixed_i64(values)]).unwrap()
    }

    fn operator(config: JoinConfig, pool: &Arc<MemoryPool>) -> HashJoinOperator {
        HashJoinOperator::try_new(config, i64_schema("b"), i64_schema("a"), pool).unwrap()
    }

    /// Drives the operator through the scheduler loop and collects output.
    fn drive(op: &mut HashJoinOperator, build: &[Batch], probe: &[Batch]) -> Vec<Batch> {
        let mut outputs = Vec::new();
        let (mut bi, mut pi) = (0, 0);
        loop {
            match op.get_state() {
                OperatorState::CanConsumeRight => {
                    if bi < build.len() {
                        op.consume_data_right(&build[bi]).unwrap();
                        bi += 1;
                    } else {
                        op.no_more_to_consume_right().unwrap();
                    }
                }
                OperatorState::CanConsumeLeft => {
                    if pi < probe.len() {
                        op.consume_data_left(&probe[pi]).unwrap();
                        pi += 1;
                    } else {
                        op.no_more_to_consume_left().unwrap();
                    }
                }
                OperatorState::CanProduce => {
                    if let Some(b) = op.output_data().unwrap() {
                        outputs.push(b);
                    }
                }
                OperatorState::Done => return outputs,
            }
        }
    }

    /// Output rows as (probe value, build value) pairs, sorted.
    fn pairs(outputs: &[Batch]) -> Vec<(Option<i64>, Option<i64>)> {
        let mut rows = Vec::new();
        for batch in outputs {
            for row in 0..batch.num_rows() {
                rows.push((batch.column(0).i64_at(row), batch.column(1).i64_at(row)));
            }
        }
        rows.sort();
        rows
    }

    fn inner_config() -> JoinConfig {
        JoinConfig::new(JoinType::Inner, vec![0], vec![0])
    }

    #[test]
    fn inner_join_basic() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(inner_config(), &pool);
        let out = drive(
            &mut op,
            &[i64_batch(&[Some(1), Some(1), Some(2)])],
            &[i64_batch(&[Some(1), Some(2), Some(3)])],
        );
        assert_eq!(
            pairs(&out),
            vec![
                (Some(1), Some(1)),
                (Some(1), Some(1)),
                (Some(2), Some(2)),
            ]
        );
    }

    #[test]
    fn left_join_emits_unmatched_probe() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(JoinConfig::new(JoinType::Left, vec![0], vec![0]), &pool);
        let out = drive(
            &mut op,
            &[i64_batch(&[Some(1), Some(1), Some(2)])],
            &[i64_batch(&[Some(1), Some(2), Some(3)])],
        );
        assert_eq!(
            pairs(&out),
            vec![
                (Some(1), Some(1)),
                (Some(1), Some(1)),
                (Some(2), Some(2)),
                (Some(3), None),
            ]
        );
    }

    #[test]
    fn right_join_emits_unmatched_build() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(JoinConfig::new(JoinType::Right, vec![0], vec![0]), &pool);
        let out = drive(
            &mut op,
            &[i64_batch(&[Some(1), Some(5)])],
            &[i64_batch(&[Some(1), Some(2)])],
        );
        assert_eq!(pairs(&out), vec![(None, Some(5)), (Some(1), Some(1))]);
    }

    #[test]
    fn full_join_emits_both_sides() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(JoinConfig::new(JoinType::Full, vec![0], vec![0]), &pool);
        let out = drive(
            &mut op,
            &[i64_batch(&[Some(1), Some(5)])],
            &[i64_batch(&[Some(1), Some(2)])],
        );
        assert_eq!(
            pairs(&out),
            vec![(None, Some(5)), (Some(1), Some(1)), (Some(2), None)]
        );
    }

    #[test]
    fn forced_spill_matches_in_memory_result() {
        // single partition so the one shrink call spills the whole build
        // side, exercising spill -> buffer probe -> replay
        let config = inner_config().with_num_partitions(1);
        let pool = MemoryPool::unbounded();
        let mut op = operator(config, &pool);
        op.consume_data_right(&i64_batch(&[Some(1), Some(1), Some(2)]))
            .unwrap();
        assert!(op.shrinkable_memory() > 0);
        assert!(op.shrink_memory(usize::MAX).unwrap());
        assert_eq!(op.shrinkable_memory(), 0);
        op.no_more_to_consume_right().unwrap();
        let out = drive(&mut op, &[], &[i64_batch(&[Some(1), Some(2), Some(3)])]);
        assert_eq!(
            pairs(&out),
            vec![
                (Some(1), Some(1)),
                (Some(1), Some(1)),
                (Some(2), Some(2)),
            ]
        );
        assert!(op.metrics().spill_count > 0);
        assert_eq!(op.metrics().replayed_partitions, 1);
    }

    #[test]
    fn multiplicity_preserved_under_spill() {
        // key 7: 3 build rows x 4 probe rows = 12 output rows
        let config = inner_config().with_num_partitions(2);
        let pool = MemoryPool::unbounded();
        let mut op = operator(config, &pool);
        op.consume_data_right(&i64_batch(&[Some(7), Some(7)])).unwrap();
        op.consume_data_right(&i64_batch(&[Some(7), Some(9)])).unwrap();
        op.shrink_memory(usize::MAX).unwrap();
        op.no_more_to_consume_right().unwrap();
        let out = drive(
            &mut op,
            &[],
            &[
                i64_batch(&[Some(7), Some(7)]),
                i64_batch(&[Some(7), Some(7)]),
            ],
        );
        let rows = pairs(&out);
        assert_eq!(rows.len(), 12);
        assert!(rows.iter().all(|r| *r == (Some(7), Some(7))));
    }

    #[test]
    fn mid_probe_spill_keeps_matched_bits() {
        // build row 7 matches before the spill; after replay only build
        // row 9 may be emitted as unmatched
        let config = JoinConfig::new(JoinType::Right, vec![0], vec![0]).with_num_partitions(1);
        let pool = MemoryPool::unbounded();
        let mut op = operator(config, &pool);
        op.consume_data_right(&i64_batch(&[Some(7), Some(9)])).unwrap();
        op.no_more_to_consume_right().unwrap();
        op.consume_data_left(&i64_batch(&[Some(7)])).unwrap();
        assert!(op.shrink_memory(usize::MAX).unwrap());
        op.consume_data_left(&i64_batch(&[Some(8)])).unwrap();
        let out = drive(&mut op, &[], &[]);
        assert_eq!(pairs(&out), vec![(None, Some(9)), (Some(7), Some(7))]);
    }

    #[test]
    fn shrink_with_nothing_to_spill_is_a_noop() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(inner_config(), &pool);
        assert_eq!(op.shrinkable_memory(), 0);
        assert!(!op.shrink_memory(1024).unwrap());
        assert_eq!(op.get_state(), OperatorState::CanConsumeRight);
    }

    #[test]
    fn residual_failures_count_as_non_matches() {
        let residual: ResidualPredicate =
            Arc::new(|probe, row, _build, _| probe.column(0).i64_at(row) == Some(1));
        let config = JoinConfig::new(JoinType::Left, vec![0], vec![0]).with_residual(residual);
        let pool = MemoryPool::unbounded();
        let mut op = operator(config, &pool);
        let out = drive(
            &mut op,
            &[i64_batch(&[Some(1), Some(2)])],
            &[i64_batch(&[Some(1), Some(2), Some(3)])],
        );
        assert_eq!(
            pairs(&out),
            vec![(Some(1), Some(1)), (Some(2), None), (Some(3), None)]
        );
    }

    #[test]
    fn null_keys_join_nothing() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(inner_config(), &pool);
        let out = drive(
            &mut op,
            &[i64_batch(&[Some(1), None])],
            &[i64_batch(&[None, Some(1)])],
        );
        assert_eq!(pairs(&out), vec![(Some(1), Some(1))]);

        let mut op = operator(JoinConfig::new(JoinType::Full, vec![0], vec![0]), &pool);
        let out = drive(
            &mut op,
            &[i64_batch(&[Some(1), None])],
            &[i64_batch(&[None, Some(1)])],
        );
        // the null probe row and the null build row each surface once
        assert_eq!(pairs(&out).len(), 3);
    }

    #[test]
    fn memory_ceiling_forces_spill_and_preserves_result() {
        let keys: Vec<Option<i64>> = (0..500).map(|i| Some(i % 50)).collect();
        let build: Vec<Batch> = keys.chunks(100).map(i64_batch).collect();
        let probe: Vec<Batch> = keys.chunks(100).map(i64_batch).collect();

        let unbounded = MemoryPool::unbounded();
        let mut reference = operator(
            inner_config().with_num_partitions(4).with_target_batch_size(64),
            &unbounded,
        );
        let expected = pairs(&drive(&mut reference, &build, &probe));
        // 10 matches per key, 50 keys
        assert_eq!(expected.len(), 500 * 10 / 50 * 10);

        let tight = MemoryPool::new(8 * 1024);
        let mut op = operator(
            inner_config().with_num_partitions(4).with_target_batch_size(64),
            &tight,
        );
        let out = pairs(&drive(&mut op, &build, &probe));
        assert!(op.metrics().spill_count > 0, "ceiling should force spills");
        assert_eq!(out, expected);
        op.close();
        assert_eq!(tight.reserved(), 0);
    }

    #[test]
    fn selection_lists_are_honored_on_both_sides() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(inner_config(), &pool);
        let build = Batch::try_new(vec![Column::fixed_i64(&[Some(9), Some(1), Some(9)])])
            .unwrap()
            .with_selection(vec![1])
            .unwrap();
        let probe = Batch::try_new(vec![Column::fixed_i64(&[Some(1), Some(9)])])
            .unwrap()
            .with_selection(vec![0])
            .unwrap();
        let out = drive(&mut op, &[build], &[probe]);
        assert_eq!(pairs(&out), vec![(Some(1), Some(1))]);
    }

    #[test]
    fn consume_in_wrong_state_is_an_error() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(inner_config(), &pool);
        assert!(op.consume_data_left(&i64_batch(&[Some(1)])).is_err());
        op.no_more_to_consume_right().unwrap();
        assert!(op.consume_data_right(&i64_batch(&[Some(1)])).is_err());
        assert!(op.no_more_to_consume_right().is_err());
    }

    #[test]
    fn close_is_safe_in_any_state() {
        let pool = MemoryPool::new(1024 * 1024);
        let mut op = operator(inner_config(), &pool);
        op.consume_data_right(&i64_batch(&[Some(1), Some(2)])).unwrap();
        op.close();
        assert_eq!(op.get_state(), OperatorState::Done);
        assert_eq!(pool.reserved(), 0);
        // closing twice is fine
        op.close();
    }

    #[test]
    fn output_schema_is_probe_then_build() {
        let pool = MemoryPool::unbounded();
        let op = operator(inner_config(), &pool);
        let schema = op.output_schema();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.field(0).name, "b");
        assert_eq!(schema.field(1).name, "a");
    }

    #[test]
    fn empty_build_side_left_join() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(JoinConfig::new(JoinType::Left, vec![0], vec![0]), &pool);
        let out = drive(&mut op, &[], &[i64_batch(&[Some(1), Some(2)])]);
        assert_eq!(pairs(&out), vec![(Some(1), None), (Some(2), None)]);
    }

    #[test]
    fn empty_probe_side_right_join() {
        let pool = MemoryPool::unbounded();
        let mut op = operator(JoinConfig::new(JoinType::Right, vec![0], vec![0]), &pool);
        let out = drive(&mut op, &[i64_batch(&[Some(1), Some(2)])], &[]);
        assert_eq!(pairs(&out), vec![(None, Some(1)), (None, Some(2))]);
    }

    #[test]
    fn spill_during_unmatched_scan_keeps_later_partitions_complete() {
        // route keys with the level 0 hash so partition 0 is both the first
        // partition drained and the largest spill victim
        let state = partition_random_state(0);
        let mut by_partition: Vec<Vec<i64>> = vec![Vec::new(), Vec::new()];
        for k in 0..200i64 {
            let col = Column::fixed_i64(&[Some(k)]);
            let p = (hash::hash_row(&[&col], 0, &state) % 2) as usize;
            by_partition[p].push(k);
        }
        let mut build: Vec<Option<i64>> =
            by_partition[0][..20].iter().copied().map(Some).collect();
        build.extend(by_partition[1][..3].iter().copied().map(Some));
        let mut expected = build.clone();
        expected.sort();

        let config = JoinConfig::new(JoinType::Right, vec![0], vec![0])
            .with_num_partitions(2)
            .with_target_batch_size(1);
        let pool = MemoryPool::unbounded();
        let mut op = operator(config, &pool);
        op.consume_data_right(&i64_batch(&build)).unwrap();
        op.no_more_to_consume_right().unwrap();
        op.no_more_to_consume_left().unwrap();

        // one unmatched row out, then spill the partition mid-scan
        let first = op.output_data().unwrap().unwrap();
        assert_eq!(first.num_rows(), 1);
        assert!(op.shrink_memory(1).unwrap());

        let mut rows: Vec<Option<i64>> = vec![first.column(1).i64_at(0)];
        while let Some(batch) = op.output_data().unwrap() {
            for r in 0..batch.num_rows() {
                rows.push(batch.column(1).i64_at(r));
            }
        }
        rows.sort();
        assert_eq!(rows, expected, "every build row must surface exactly once");
    }

    #[test]
    fn recursion_cap_surfaces_fatal_out_of_memory() {
        // a single hot key defeats repartitioning at every level, so the
        // operator must eventually refuse to spill and fail loudly
        let pool = MemoryPool::new(2 * 1024);
        let config = inner_config()
            .with_num_partitions(2)
            .with_target_batch_size(32);
        let mut op = operator(config, &pool);
        let chunk = i64_batch(&vec![Some(7); 32]);
        let mut fed = 0;
        let err = loop {
            match op.get_state() {
                OperatorState::CanConsumeRight => {
                    if fed < 64 {
                        op.consume_data_right(&chunk).unwrap();
                        fed += 1;
                    } else {
                        op.no_more_to_consume_right().unwrap();
                    }
                }
                OperatorState::CanConsumeLeft => op.no_more_to_consume_left().unwrap(),
                OperatorState::CanProduce => match op.output_data() {
                    Ok(_) => {}
                    Err(e) => break e,
                },
                OperatorState::Done => panic!("one hot key cannot fit the ceiling at any level"),
            }
        };
        assert!(matches!(err, JoinError::ResourcesExhausted(_)));
        assert!(err.to_string().contains("repartition level"));
    }

    #[test]
    fn random_full_join_spilled_matches_in_memory() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(42);
        let gen = |rng: &mut StdRng, n: usize| -> Vec<Option<i64>> {
            (0..n)
                .map(|_| {
                    if rng.random_range(0..20) == 0 {
                        None
                    } else {
                        Some(rng.random_range(0..40))
                    }
                })
                .collect()
        };
        let build: Vec<Batch> = (0..4).map(|_| i64_batch(&gen(&mut rng, 80))).collect();
        let probe: Vec<Batch> = (0..4).map(|_| i64_batch(&gen(&mut rng, 80))).collect();

        let config = JoinConfig::new(JoinType::Full, vec![0], vec![0])
            .with_num_partitions(4)
            .with_target_batch_size(32);
        let unbounded = MemoryPool::unbounded();
        let mut reference = operator(config.clone(), &unbounded);
        let expected = pairs(&drive(&mut reference, &build, &probe));

        let tight = MemoryPool::new(4 * 1024);
        let mut op = operator(config, &tight);
        let out = pairs(&drive(&mut op, &build, &probe));
        assert_eq!(out, expected);
    }
}
