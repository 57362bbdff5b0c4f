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

//! Error types for the join engine.

use std::result;

/// Error returned by the join engine.
///
/// Only `ResourcesExhausted` is recoverable, and only through the bounded
/// retry in the operator's shrink path. Every other variant is fatal for the
/// current query: a partial spill page or a corrupt page cannot be repaired
/// without risking dropped or duplicated join rows.
#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    /// The memory pool could not satisfy a reservation, even after spilling.
    #[error("Resources exhausted: {0}")]
    ResourcesExhausted(String),

    /// A spill file could not be written or read back.
    #[error("Spill I/O error: {source}")]
    SpillIo {
        #[from]
        source: std::io::Error,
    },

    /// A spill page failed validation during decode (bad header, truncated
    /// sub-buffer, size mismatch). Never skipped: the page is the only copy
    /// of the spilled rows.
    #[error("Corrupt spill page: {0}")]
    CorruptPage(String),

    /// An internal invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type JoinResult<T> = result::Result<T, JoinError>;
