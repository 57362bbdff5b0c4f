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

//! The hash join operator: partitioned hash index, spill handling and the
//! pull-based state machine.

pub mod hash_index;
pub mod metrics;
pub mod operator;
pub(crate) mod partition;

pub use metrics::JoinMetrics;
pub use operator::{HashJoinOperator, JoinConfig, ResidualPredicate};

/// Which side's unmatched rows survive into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    /// Probe rows without a build match are emitted with a null build side.
    pub(crate) fn emits_unmatched_probe(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    /// Build rows never matched are emitted with a null probe side.
    pub(crate) fn emits_unmatched_build(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }
}

/// Externally visible operator state; the scheduler polls this to decide
/// the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    /// A probe-side batch is wanted.
    CanConsumeLeft,
    /// A build-side batch is wanted.
    CanConsumeRight,
    /// Output is available or a reclaim step is pending.
    CanProduce,
    /// Terminal.
    Done,
}
