// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Backing storage of the custom characteristic.
//!
//! Long values arrive as a series of offset-addressed fragments. A write at
//! offset zero starts a new value, so the whole buffer is cleared first and no
//! bytes of a previous, longer value survive into later reads.

use thiserror::Error;
use tracing::debug;

use super::ble_constants::{CUSTOM_VALUE_CAPACITY, CUSTOM_VALUE_INITIAL};

/// ATT protocol errors returned to the peer.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AttError {
    #[error("invalid attribute handle")]
    InvalidHandle,
    #[error("invalid offset")]
    InvalidOffset,
}

impl AttError {
    /// ATT error code carried in the Error Response PDU.
    pub fn code(self) -> u8 {
        match self {
            AttError::InvalidHandle => 0x01,
            AttError::InvalidOffset => 0x07,
        }
    }
}

/// Fixed-capacity attribute value with bounds-checked access.
pub struct AttributeStore {
    value: Box<[u8]>,
}

impl AttributeStore {
    /// Create a store holding the boot-time value.
    pub fn new() -> Self {
        Self::with_initial(CUSTOM_VALUE_CAPACITY, CUSTOM_VALUE_INITIAL)
    }

    /// Create a zeroed store of `capacity` bytes with `initial` copied to its start.
    ///
    /// `initial` is cut to `capacity` if it does not fit.
    pub fn with_initial(capacity: usize, initial: &[u8]) -> Self {
        let mut value = vec![0u8; capacity].into_boxed_slice();
        let n = initial.len().min(capacity);
        value[..n].copy_from_slice(&initial[..n]);
        Self { value }
    }

    pub fn capacity(&self) -> usize {
        self.value.len()
    }

    /// Read up to `max_len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, max_len: usize) -> Result<Vec<u8>, AttError> {
        if offset > self.capacity() {
            return Err(AttError::InvalidOffset);
        }
        let len = max_len.min(self.capacity() - offset);
        Ok(self.value[offset..offset + len].to_vec())
    }

    /// Write `data` at `offset`, returning the number of bytes accepted.
    ///
    /// A rejected write leaves the value untouched.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<usize, AttError> {
        let end = offset
            .checked_add(data.len())
            .ok_or(AttError::InvalidOffset)?;
        if end > self.capacity() {
            return Err(AttError::InvalidOffset);
        }

        if offset == 0 {
            self.value.fill(0);
        }
        self.value[offset..end].copy_from_slice(data);

        debug!("Stored {} bytes at offset {}", data.len(), offset);
        Ok(data.len())
    }
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8) | 1).collect()
    }

    #[test]
    fn test_initial_value() {
        let store = AttributeStore::new();
        assert_eq!(store.capacity(), 512);
        assert_eq!(store.read(0, 13).unwrap(), b"Initial value");
        assert_eq!(store.read(13, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_write_then_read_returns_data() {
        let mut store = AttributeStore::new();
        let cases = [(0usize, 1usize), (0, 512), (17, 40), (500, 12), (511, 1), (512, 0)];
        for (offset, len) in cases {
            let data = pattern(len, offset as u8);
            assert_eq!(store.write(offset, &data), Ok(len));
            assert_eq!(store.read(offset, len).unwrap(), data);
        }
    }

    #[test]
    fn test_out_of_bounds_write_leaves_buffer_unchanged() {
        let mut store = AttributeStore::new();
        store.write(0, &pattern(64, 3)).unwrap();
        let before = store.read(0, 512).unwrap();

        assert_eq!(store.write(500, &[0xAA; 20]), Err(AttError::InvalidOffset));
        assert_eq!(store.write(512, &[1]), Err(AttError::InvalidOffset));
        assert_eq!(store.write(0, &[0x55; 513]), Err(AttError::InvalidOffset));
        assert_eq!(store.write(usize::MAX, &[1]), Err(AttError::InvalidOffset));

        assert_eq!(store.read(0, 512).unwrap(), before);
    }

    #[test]
    fn test_zero_offset_write_clears_old_tail() {
        let mut store = AttributeStore::new();
        store.write(0, &[0xFF; 64]).unwrap();
        store.write(0, &[0x11; 10]).unwrap();

        assert_eq!(store.read(20, 10).unwrap(), vec![0u8; 10]);
        assert_eq!(store.read(0, 10).unwrap(), vec![0x11; 10]);
        assert_eq!(store.read(10, 54).unwrap(), vec![0u8; 54]);
    }

    #[test]
    fn test_fragmented_write_assembles_value() {
        let mut store = AttributeStore::new();
        store.write(0, &[0xEE; 300]).unwrap();

        let value = pattern(100, 7);
        for (i, chunk) in value.chunks(18).enumerate() {
            store.write(i * 18, chunk).unwrap();
        }

        assert_eq!(store.read(0, 100).unwrap(), value);
        assert_eq!(store.read(100, 200).unwrap(), vec![0u8; 200]);
    }

    #[test]
    fn test_read_is_bounded_by_capacity() {
        let store = AttributeStore::new();
        for offset in [0usize, 1, 100, 497, 511, 512] {
            let out = store.read(offset, 4096).unwrap();
            assert_eq!(out.len(), 512 - offset);
        }
        assert_eq!(store.read(500, 5).unwrap().len(), 5);
        assert_eq!(store.read(513, 1), Err(AttError::InvalidOffset));
    }

    #[test]
    fn test_every_offset_respects_bounds() {
        let mut store = AttributeStore::new();
        let capacity = store.capacity();

        for offset in 0..=capacity + 1 {
            match store.read(offset, usize::MAX) {
                Ok(out) => {
                    assert!(offset <= capacity);
                    assert_eq!(out.len(), capacity - offset);
                }
                Err(e) => {
                    assert!(offset > capacity);
                    assert_eq!(e, AttError::InvalidOffset);
                }
            }

            let before = store.read(0, capacity).unwrap();
            let overflow = vec![0xA5; capacity.saturating_sub(offset) + 1];
            assert_eq!(store.write(offset, &overflow), Err(AttError::InvalidOffset));
            assert_eq!(store.read(0, capacity).unwrap(), before);

            if offset < capacity {
                let data = pattern((capacity - offset).min(8), offset as u8);
                assert_eq!(store.write(offset, &data), Ok(data.len()));
                assert_eq!(store.read(offset, data.len()).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_att_error_codes() {
        assert_eq!(AttError::InvalidHandle.code(), 0x01);
        assert_eq!(AttError::InvalidOffset.code(), 0x07);
    }
}
