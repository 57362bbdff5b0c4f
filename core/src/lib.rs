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

//! Out-of-core vectorized hash join engine.
//!
//! The entry point is [`HashJoinOperator`], a pull-based operator driven by
//! an external scheduler: it advertises through [`OperatorState`] whether it
//! wants a build-side batch, a probe-side batch, or can produce output, and
//! every call does a bounded amount of work. Build rows are partitioned by
//! key hash; when the [`MemoryPool`] ceiling is hit, whole partitions are
//! serialized page by page to temporary spill files and replayed during the
//! drain phase by a nested operator with a reseeded hash, recursively if a
//! partition stays too large.
//!
//! Batches use a closed columnar model ([`vector::Column`]) with validity
//! bitmaps and optional selection lists. Spill pages are produced by a
//! measure-then-copy framework ([`vector::sizer`]) that computes the exact
//! page size before a single allocation-free copy pass.

#![deny(clippy::clone_on_ref_ptr)]

pub mod common;
pub mod errors;
pub mod join;
pub mod memory;
pub mod spill;
pub mod vector;

pub use errors::{JoinError, JoinResult};
pub use join::{HashJoinOperator, JoinConfig, JoinMetrics, JoinType, OperatorState, ResidualPredicate};
pub use memory::{MemoryPool, MemoryReservation};
pub use vector::{Batch, Column, ColumnBuilder, DataType, Field, Schema};
