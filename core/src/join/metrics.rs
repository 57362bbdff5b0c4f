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

//! Operator counters, reported through the `log` facade at close.

use log::info;

#[derive(Debug, Default, Clone)]
pub struct JoinMetrics {
    pub build_rows: usize,
    pub probe_rows: usize,
    pub output_rows: usize,
    pub spill_count: usize,
    pub spilled_pages: usize,
    pub spilled_bytes: u64,
    pub replayed_partitions: usize,
}

impl JoinMetrics {
    pub fn log_summary(&self, recursion_level: usize) {
        info!(
            "hash join done (level {recursion_level}): {} build rows, {} probe rows, \
             {} output rows, {} spills ({} pages, {} bytes), {} partitions replayed",
            self.build_rows,
            self.probe_rows,
            self.output_rows,
            self.spill_count,
            self.spilled_pages,
            self.spilled_bytes,
            self.replayed_partitions,
        );
    }
}
