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

//! Bit-level utilities shared by validity bitmaps and the spill page codec.

use std::cmp::min;

static BIT_MASK: [u8; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// Returns `ceil(value / divisor)`.
#[inline]
pub fn ceil(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor)
}

/// Rounds `bits` up to the next multiple of 64. All sub-buffers inside a
/// spill page start and end on 64-bit boundaries so a page stays directly
/// addressable after decode.
#[inline]
pub fn round_upto_64(bits: u64) -> u64 {
    (bits + 63) & !63
}

/// Byte count of a 64-bit aligned region holding `bytes` raw bytes.
#[inline]
pub fn padded_len(bytes: usize) -> usize {
    (bytes + 7) & !7
}

/// Returns whether bit at position `i` in `data` is set.
#[inline]
pub fn get_bit(data: &[u8], i: usize) -> bool {
    (data[i >> 3] & BIT_MASK[i & 7]) != 0
}

/// Sets bit at position `i` in `bits`.
#[inline]
pub fn set_bit(bits: &mut [u8], i: usize) {
    bits[i / 8] |= 1 << (i % 8);
}

/// Clears bit at position `i` in `bits`.
#[inline]
pub fn unset_bit(bits: &mut [u8], i: usize) {
    bits[i / 8] &= !(1 << (i % 8));
}

/// Sets `length` bits starting at `offset`, using bulk byte writes for the
/// interior span.
pub fn set_bits(bits: &mut [u8], offset: usize, length: usize) {
    let mut byte_i = offset / 8;
    let offset_r = offset % 8;
    let end = offset + length;
    let end_byte_i = end / 8;
    let end_r = end % 8;

    // if the offset starts in the middle of a byte, update that byte first
    if offset_r != 0 {
        let num_bits = min(length, 8 - offset_r);
        bits[byte_i] |= (((1u16 << num_bits) - 1) as u8) << offset_r;
        byte_i += 1;
    }

    if byte_i < end_byte_i {
        bits[byte_i..end_byte_i].fill(0xff);
        byte_i = end_byte_i;
    }

    if end_r > 0 && byte_i == end_byte_i {
        bits[byte_i] |= (1u8 << end_r) - 1;
    }
}

/// Mixes two 64-bit hashes into one. Used to fold per-column value hashes
/// into a whole-key fingerprint.
#[inline(always)]
pub fn mix_hash(lower: u64, upper: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(lower);
    hash.wrapping_mul(37).wrapping_add(upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil() {
        assert_eq!(ceil(0, 8), 0);
        assert_eq!(ceil(1, 8), 1);
        assert_eq!(ceil(8, 8), 1);
        assert_eq!(ceil(9, 8), 2);
    }

    #[test]
    fn test_round_upto_64() {
        assert_eq!(round_upto_64(0), 0);
        assert_eq!(round_upto_64(1), 64);
        assert_eq!(round_upto_64(64), 64);
        assert_eq!(round_upto_64(65), 128);
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 8);
        assert_eq!(padded_len(8), 8);
        assert_eq!(padded_len(9), 16);
    }

    #[test]
    fn test_get_set_unset_bit() {
        let mut buf = vec![0u8; 4];
        for i in [0, 3, 9, 31] {
            assert!(!get_bit(&buf, i));
            set_bit(&mut buf, i);
            assert!(get_bit(&buf, i));
        }
        unset_bit(&mut buf, 9);
        assert!(!get_bit(&buf, 9));
        assert!(get_bit(&buf, 3));
    }

    #[test]
    fn test_set_bits_spans() {
        for (offset, length) in [(0, 3), (5, 9), (3, 20), (8, 8), (0, 32), (7, 1)] {
            let mut buf = vec![0u8; 8];
            set_bits(&mut buf, offset, length);
            for i in 0..64 {
                assert_eq!(
                    get_bit(&buf, i),
                    i >= offset && i < offset + length,
                    "offset={offset} length={length} bit={i}"
                );
            }
        }
    }
}
