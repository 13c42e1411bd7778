// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-local memory: fixed-size block pool, arena, segment ref table and
// the block queue built on the pool.

pub mod chunk;
pub mod pool;
pub mod queue;
pub mod seg_ref;

pub use chunk::{ChunkPool, PAGE_SLOT_NUM};
pub use pool::{CleanupId, MemPool};
pub use queue::{Block, Queue};
pub use seg_ref::SegRefTable;
