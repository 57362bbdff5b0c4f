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

use crate::common::bit;

/// All page buffers are sized to a multiple of 64 bytes.
const ALIGNMENT: usize = 64;

/// An owned, zero-filled buffer backing one spill page.
///
/// The capacity is rounded up to a multiple of 64 bytes so every sub-buffer
/// written at a 64-bit boundary stays within the allocation, and the length
/// always equals the capacity. It is up to the writer to decide which part
/// of the buffer contains valid data.
#[derive(Debug)]
pub struct PageBuffer {
    data: Vec<u8>,
}

impl PageBuffer {
    /// Initializes a zero-filled buffer of at least `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let aligned = capacity.div_ceil(ALIGNMENT) * ALIGNMENT;
        Self {
            data: vec![0u8; aligned],
        }
    }

    /// Returns the capacity of this buffer.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the data stored in this buffer as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the data stored in this buffer as a mutable slice.
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the buffer, truncated to `len` bytes.
    ///
    /// `len` must be 64-bit aligned; a page never ends mid-word.
    pub fn into_vec(mut self, len: usize) -> Vec<u8> {
        debug_assert!(len <= self.data.len());
        debug_assert_eq!(len, bit::padded_len(len));
        self.data.truncate(len);
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(PageBuffer::new(0).capacity(), 0);
        assert_eq!(PageBuffer::new(1).capacity(), 64);
        assert_eq!(PageBuffer::new(64).capacity(), 64);
        assert_eq!(PageBuffer::new(65).capacity(), 128);
    }

    #[test]
    fn starts_zeroed() {
        let buf = PageBuffer::new(100);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }
}
