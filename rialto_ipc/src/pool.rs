// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Scratch buffers for outgoing messages. Typical replies are small and
//! bursty, so each endpoint carves one 64 KiB arena into fixed-size slabs up
//! front; in steady state a small send allocates nothing. Requests that do
//! not fit any free slab fall back to the heap.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use log::*;

const ARENA_SIZE: usize = 64 * 1024;

/// (slab size, count) classes the arena is carved into, ascending so a
/// first-fit scan lands on the smallest slab that is big enough.
const SLAB_CLASSES: &[(usize, usize)] = &[(256, 8), (1024, 6), (4096, 2), (16384, 1), (32768, 1)];

/// Buffers may hold a `msghdr` at offset zero, so every allocation (arena
/// slabs and heap fallbacks alike) is 8-byte aligned.
const BUFFER_ALIGN: usize = 8;

struct Slab {
    offset: usize,
    size: usize,
    free: bool,
}

struct Shared {
    arena: NonNull<u8>,
    slabs: Mutex<Vec<Slab>>,
}

// SAFETY: the arena pointer is only dereferenced through PoolBuffer handles,
// each of which has exclusive use of its slab range while allocated.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Drop for Shared {
    fn drop(&mut self) {
        // SAFETY: allocated in SendBufferPool::new with the same layout.
        unsafe { dealloc(self.arena.as_ptr(), arena_layout()) };
    }
}

fn arena_layout() -> Layout {
    // infallible for these constants
    Layout::from_size_align(ARENA_SIZE, BUFFER_ALIGN).expect("valid arena layout")
}

pub struct SendBufferPool {
    shared: Arc<Shared>,
}

impl SendBufferPool {
    pub fn new() -> Self {
        // SAFETY: the layout has non-zero size.
        let arena = unsafe { alloc(arena_layout()) };
        let Some(arena) = NonNull::new(arena) else {
            handle_alloc_error(arena_layout());
        };

        let mut slabs = Vec::new();
        let mut offset = 0;
        for &(size, count) in SLAB_CLASSES {
            for _ in 0..count {
                slabs.push(Slab {
                    offset,
                    size,
                    free: true,
                });
                offset += size;
            }
        }
        debug_assert!(offset <= ARENA_SIZE);

        Self {
            shared: Arc::new(Shared {
                arena,
                slabs: Mutex::new(slabs),
            }),
        }
    }

    /// Hand out the smallest free slab of at least `len` bytes, or a heap
    /// block if the arena has nothing suitable. The buffer returns to the
    /// pool when the handle drops.
    pub fn allocate(&self, len: usize) -> PoolBuffer {
        {
            let mut slabs = self.shared.slabs.lock().unwrap();
            if let Some((index, slab)) = slabs
                .iter_mut()
                .enumerate()
                .find(|(_, slab)| slab.free && slab.size >= len)
            {
                slab.free = false;
                // SAFETY: the slab range lies inside the arena allocation.
                let ptr = unsafe { NonNull::new_unchecked(self.shared.arena.as_ptr().add(slab.offset)) };
                return PoolBuffer {
                    shared: Arc::clone(&self.shared),
                    ptr,
                    len,
                    kind: BufferKind::Slab(index),
                };
            }
        }

        trace!("no static buffers for alloc of size {len}");

        let layout = match Layout::from_size_align(len.max(1), BUFFER_ALIGN) {
            Ok(layout) => layout,
            Err(_) => handle_alloc_error(arena_layout()),
        };
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        PoolBuffer {
            shared: Arc::clone(&self.shared),
            ptr,
            len,
            kind: BufferKind::Heap(layout),
        }
    }
}

impl Default for SendBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

enum BufferKind {
    Slab(usize),
    Heap(Layout),
}

/// An allocation from a [`SendBufferPool`]. Derefs to `[u8]` of the
/// requested length; the underlying slab may be larger.
pub struct PoolBuffer {
    shared: Arc<Shared>,
    ptr: NonNull<u8>,
    len: usize,
    kind: BufferKind,
}

// SAFETY: the handle has exclusive use of its memory range.
unsafe impl Send for PoolBuffer {}

impl PoolBuffer {
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the range is within a live allocation exclusively ours.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for Deref, and the handle is uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        match self.kind {
            BufferKind::Slab(index) => {
                let mut slabs = self.shared.slabs.lock().unwrap();
                let slab = &mut slabs[index];
                if slab.free {
                    // a double free here means the free list is corrupt and
                    // any further pool use is undefined
                    error!("trying to free an unknown buffer from the pool!");
                    std::process::abort();
                }
                slab.free = true;
            }
            BufferKind::Heap(layout) => {
                // SAFETY: allocated in SendBufferPool::allocate with `layout`.
                unsafe { dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}
