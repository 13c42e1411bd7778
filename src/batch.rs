// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Frame batches carried in queue blocks between pipeline stages.
//
// Frames are decoded once, at the socket, so batch entries use a native
// in-process header rather than the wire header:
//
//   batch:  num: u32 | pad: u32 | entry*
//   entry:  ty: u16 | pad: u16 | node_id: i32 | len: u32 | body[len]
//
// The same entry layout carries single forwarded frames (`node_id` is then
// the destination) in the distribution and forward queues.

use std::time::Instant;

use crate::error::{Error, Result};
use crate::mem::Block;

pub const BATCH_HDR: usize = 8;
pub const ENTRY_HDR: usize = 12;

/// One decoded entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub ty: u16,
    pub node_id: i32,
    pub body: &'a [u8],
}

/// Entry header bytes for `(ty, node_id, len)`.
pub fn entry_header(ty: u16, node_id: i32, len: usize) -> [u8; ENTRY_HDR] {
    let mut b = [0u8; ENTRY_HDR];
    b[0..2].copy_from_slice(&ty.to_ne_bytes());
    b[4..8].copy_from_slice(&node_id.to_ne_bytes());
    b[8..12].copy_from_slice(&(len as u32).to_ne_bytes());
    b
}

/// Split one entry off the front of `bytes`.
pub fn read_entry(bytes: &[u8]) -> Result<(Entry<'_>, &[u8])> {
    if bytes.len() < ENTRY_HDR {
        return Err(Error::invalid(format!("truncated entry header: {} bytes", bytes.len())));
    }
    let ty = u16::from_ne_bytes([bytes[0], bytes[1]]);
    let node_id = i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let len = u32::from_ne_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let rest = &bytes[ENTRY_HDR..];
    if rest.len() < len {
        return Err(Error::invalid(format!("entry body of {len} bytes, {} left", rest.len())));
    }
    Ok((Entry { ty, node_id, body: &rest[..len] }, &rest[len..]))
}

/// Space one entry of `body_len` bytes takes in a batch.
pub fn entry_size(body_len: usize) -> usize {
    ENTRY_HDR + body_len
}

/// Accumulates entries in a queue block until it is pushed.
pub struct BatchWriter {
    block: Block,
    at: usize,
    num: u32,
    created: Instant,
}

impl BatchWriter {
    /// Take a block allocated at the queue's full unit size.
    pub fn new(block: Block) -> Self {
        Self { block, at: BATCH_HDR, num: 0, created: Instant::now() }
    }

    pub fn len(&self) -> usize {
        self.num as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// Time since the batch was started.
    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn fits(&self, body_len: usize) -> bool {
        self.at + entry_size(body_len) <= self.block.len()
    }

    /// Append one entry; `false` if it does not fit.
    pub fn push(&mut self, ty: u16, node_id: i32, body: &[u8]) -> bool {
        if !self.fits(body.len()) {
            return false;
        }
        let at = self.at;
        self.block[at..at + ENTRY_HDR].copy_from_slice(&entry_header(ty, node_id, body.len()));
        self.block[at + ENTRY_HDR..at + ENTRY_HDR + body.len()].copy_from_slice(body);
        self.at += entry_size(body.len());
        self.num += 1;
        true
    }

    /// Seal the batch; the block is trimmed to the bytes written.
    pub fn finish(mut self) -> Block {
        self.block[0..4].copy_from_slice(&self.num.to_ne_bytes());
        self.block[4..8].fill(0);
        self.block.truncate(self.at);
        self.block
    }
}

/// Walk a sealed batch, handing each entry to `f`. Returns the entry count;
/// a batch whose layout does not add up is rejected before any entry past
/// the corruption is seen.
pub fn for_each_entry<F>(batch: &[u8], mut f: F) -> Result<usize>
where
    F: FnMut(Entry<'_>),
{
    if batch.len() < BATCH_HDR {
        return Err(Error::invalid("truncated batch header"));
    }
    let num = u32::from_ne_bytes([batch[0], batch[1], batch[2], batch[3]]) as usize;
    let mut rest = &batch[BATCH_HDR..];
    for _ in 0..num {
        let (e, tail) = read_entry(rest)?;
        f(e);
        rest = tail;
    }
    Ok(num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::Queue;

    #[test]
    fn fill_until_full_then_walk() {
        let q = Queue::new(2, 64).unwrap();
        let unit = q.unit_size();
        let mut w = BatchWriter::new(q.alloc(unit).unwrap());
        let mut pushed = 0;
        while w.push(7, pushed, &[pushed as u8; 10]) {
            pushed += 1;
        }
        assert_eq!(pushed as usize, (unit - BATCH_HDR) / entry_size(10));
        assert!(!w.fits(10));

        let block = w.finish();
        let mut seen = Vec::new();
        let n = for_each_entry(&block, |e| seen.push((e.ty, e.node_id, e.body.to_vec()))).unwrap();
        assert_eq!(n, pushed as usize);
        for (i, (ty, node, body)) in seen.into_iter().enumerate() {
            assert_eq!((ty, node), (7, i as i32));
            assert_eq!(body, vec![i as u8; 10]);
        }
    }

    #[test]
    fn corrupt_length_is_rejected() {
        let q = Queue::new(1, 64).unwrap();
        let mut w = BatchWriter::new(q.alloc(64).unwrap());
        assert!(w.push(1, 1, b"abc"));
        let mut block = w.finish();
        block[BATCH_HDR + 8] = 200;
        assert!(for_each_entry(&block, |_| {}).is_err());
    }
}
