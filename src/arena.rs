// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A small bump allocator owning the byte slices and mnemonic strings that
//! back one unwinding attempt's `InstructionRecord`s.
//!
//! Hand-rolled rather than pulled in from `bumpalo`: the corpus this crate
//! is descended from does not otherwise carry an arena-crate dependency,
//! and the allocation pattern here is narrow enough (byte slices and
//! `&'static str`-shaped mnemonic names) not to need one.

use std::cell::RefCell;

/// Owns a sequence of fixed-size chunks. `copy_slice`/`intern_str` append
/// into the current chunk, allocating a new one when it's full. `reset`
/// drops all chunks' contents without deallocating the last chunk's buffer,
/// so repeated RETN-search rounds reuse the same backing memory.
pub struct Arena {
    chunks: RefCell<Vec<Vec<u8>>>,
    chunk_size: usize,
}

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

impl Arena {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: RefCell::new(vec![Vec::with_capacity(chunk_size)]),
            chunk_size,
        }
    }

    /// Copies `data` into arena-owned storage and returns a slice with a
    /// lifetime tied to the arena itself.
    pub fn copy_slice<'a>(&'a self, data: &[u8]) -> &'a [u8] {
        let mut chunks = self.chunks.borrow_mut();
        if chunks.last().map(Vec::capacity).unwrap_or(0)
            < chunks.last().map(Vec::len).unwrap_or(0) + data.len()
        {
            let new_cap = self.chunk_size.max(data.len());
            chunks.push(Vec::with_capacity(new_cap));
        }
        let chunk = chunks.last_mut().expect("arena always has a chunk");
        let start = chunk.len();
        chunk.extend_from_slice(data);
        let ptr = chunk.as_ptr();
        // Safety: the chunk's backing allocation is never moved or shrunk
        // for the lifetime of the arena; `reset` clears length but not the
        // allocation, and we never pop chunks except on `reset`, which the
        // caller must not do while a returned slice is still alive.
        unsafe { std::slice::from_raw_parts(ptr.add(start), data.len()) }
    }

    /// Interns `s` as an arena-owned `&str`.
    pub fn intern_str<'a>(&'a self, s: &str) -> &'a str {
        let bytes = self.copy_slice(s.as_bytes());
        // Safety: `bytes` is a verbatim copy of `s`'s UTF-8 bytes.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    /// Clears all chunks' contents, keeping the last chunk's allocation for
    /// reuse by the next unwinding round. Invalidates every slice previously
    /// handed out by this arena; callers must not hold onto them across a
    /// reset (the call-stack unwinder resets between RETN-search rounds and
    /// only after each round's records have been fully consumed).
    pub fn reset(&self) {
        let mut chunks = self.chunks.borrow_mut();
        chunks.truncate(1);
        chunks[0].clear();
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_slice_round_trips_bytes() {
        let arena = Arena::new();
        let data = arena.copy_slice(&[1, 2, 3, 4]);
        assert_eq!(data, &[1, 2, 3, 4]);
    }

    #[test]
    fn intern_str_round_trips() {
        let arena = Arena::new();
        let s = arena.intern_str("ret");
        assert_eq!(s, "ret");
    }

    #[test]
    fn reset_allows_reuse() {
        let arena = Arena::with_chunk_size(8);
        {
            let first = arena.copy_slice(&[1, 2, 3]);
            assert_eq!(first, &[1, 2, 3]);
        }
        arena.reset();
        let second = arena.copy_slice(&[9, 9]);
        assert_eq!(second, &[9, 9]);
    }

    #[test]
    fn allocates_new_chunk_when_full() {
        let arena = Arena::with_chunk_size(4);
        let a = arena.copy_slice(&[1, 2, 3, 4]);
        let b = arena.copy_slice(&[5, 6, 7, 8]);
        assert_eq!(a, &[1, 2, 3, 4]);
        assert_eq!(b, &[5, 6, 7, 8]);
    }
}
