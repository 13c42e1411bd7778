// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Snapshot buffer: fixed-capacity bytes with two cursors.
//
//   +--------+---------------------------+----------+
//   |consumed|   pending [optr, iptr)    |  spare   |
//   +--------+---------------------------+----------+
//   0       optr                        iptr       cap
//
// Invariant: 0 <= optr <= iptr <= cap. Used for receive reassembly (fill at
// iptr, parse from optr) and for send draining (append at iptr, write from
// optr).

use crate::error::FrameError;
use crate::frame::{self, Header, HEADER_LEN};

pub struct Snap {
    buf: Box<[u8]>,
    optr: usize,
    iptr: usize,
}

impl Snap {
    pub fn new(cap: usize) -> Self {
        Self { buf: vec![0u8; cap].into_boxed_slice(), optr: 0, iptr: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes between the cursors.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.optr..self.iptr]
    }

    pub fn pending_len(&self) -> usize {
        self.iptr - self.optr
    }

    pub fn is_empty(&self) -> bool {
        self.optr == self.iptr
    }

    /// Writable tail.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.iptr..]
    }

    pub fn room(&self) -> usize {
        self.buf.len() - self.iptr
    }

    pub fn is_full(&self) -> bool {
        self.iptr == self.buf.len()
    }

    /// Commit `n` bytes written into [`spare_mut`](Self::spare_mut).
    pub fn fill(&mut self, n: usize) {
        self.iptr = (self.iptr + n).min(self.buf.len());
    }

    /// Mark `n` pending bytes as done; rewinds when nothing is left.
    pub fn consume(&mut self, n: usize) {
        self.optr = (self.optr + n).min(self.iptr);
        if self.optr == self.iptr {
            self.reset();
        }
    }

    /// Append `data` if it fits entirely.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if data.len() > self.room() {
            return false;
        }
        self.buf[self.iptr..self.iptr + data.len()].copy_from_slice(data);
        self.iptr += data.len();
        true
    }

    pub fn reset(&mut self) {
        self.optr = 0;
        self.iptr = 0;
    }

    /// Move the pending bytes to the front. Returns the bytes gained.
    pub fn compact(&mut self) -> usize {
        let gained = self.optr;
        if gained > 0 {
            self.buf.copy_within(self.optr..self.iptr, 0);
            self.iptr -= self.optr;
            self.optr = 0;
        }
        gained
    }

    /// Hand every complete frame in the pending region to `f`, in order.
    ///
    /// A trailing partial frame stays pending. If it sits against the end of
    /// the buffer it is moved to the front so the next read has room; a
    /// frame that cannot fit even then is `FrameError::TooLarge`. Header
    /// errors stop the walk and are returned; the caller closes the
    /// connection.
    pub fn drain_frames<F>(&mut self, mut f: F) -> Result<usize, FrameError>
    where
        F: FnMut(&Header, &[u8]),
    {
        let mut count = 0;
        loop {
            let pending = self.pending();
            match frame::decode_frame(pending) {
                Ok((head, body)) => {
                    f(&head, body);
                    count += 1;
                    self.optr += head.total_len();
                }
                Err(FrameError::Incomplete { need, .. }) => {
                    if need > self.capacity() {
                        return Err(FrameError::TooLarge { len: need, cap: self.capacity() });
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if self.optr == self.iptr {
            self.reset();
        } else if self.is_full() && self.compact() == 0 {
            let need = frame::parse_header(self.pending()).map(|h| h.total_len()).unwrap_or(HEADER_LEN);
            return Err(FrameError::TooLarge { len: need, cap: self.capacity() });
        }
        Ok(count)
    }
}

impl std::fmt::Debug for Snap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snap")
            .field("cap", &self.capacity())
            .field("optr", &self.optr)
            .field("iptr", &self.iptr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, Header};

    fn stream(n: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut s = Vec::new();
        let mut bodies = Vec::new();
        for i in 0..n {
            let body: Vec<u8> = (0..(i * 7 % 23) as u8).collect();
            s.extend(encode_frame(Header::user(i as u16 % 200, i as i32, 0), &body));
            bodies.push(body);
        }
        (s, bodies)
    }

    fn feed(snap: &mut Snap, data: &[u8], chunk: usize, out: &mut Vec<(Header, Vec<u8>)>) {
        for piece in data.chunks(chunk) {
            let mut rest = piece;
            while !rest.is_empty() {
                let n = rest.len().min(snap.room());
                snap.spare_mut()[..n].copy_from_slice(&rest[..n]);
                snap.fill(n);
                rest = &rest[n..];
                snap.drain_frames(|h, b| out.push((*h, b.to_vec()))).unwrap();
            }
        }
    }

    #[test]
    fn byte_at_a_time_matches_whole_stream() {
        let (s, bodies) = stream(40);
        for &(cap, chunk) in &[(4096usize, s.len()), (64, 1), (64, 5), (48, 3)] {
            let mut snap = Snap::new(cap);
            let mut out = Vec::new();
            feed(&mut snap, &s, chunk, &mut out);
            assert_eq!(out.len(), 40, "cap {cap} chunk {chunk}");
            for (i, (h, b)) in out.iter().enumerate() {
                assert_eq!(h.node_id, i as i32);
                assert_eq!(b, &bodies[i]);
            }
            assert!(snap.is_empty());
        }
    }

    #[test]
    fn oversized_frame_is_reported() {
        let f = encode_frame(Header::user(1, 1, 0), &[0u8; 100]);
        let mut snap = Snap::new(64);
        snap.push(&f[..64]);
        assert!(matches!(snap.drain_frames(|_, _| {}), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn compaction_moves_partial_tail() {
        let a = encode_frame(Header::user(1, 1, 0), &[1u8; 10]);
        let b = encode_frame(Header::user(2, 2, 0), &[2u8; 10]);
        let mut snap = Snap::new(a.len() + 5);
        assert!(snap.push(&a));
        assert!(snap.push(&b[..5]));
        let mut seen = 0;
        snap.drain_frames(|_, _| seen += 1).unwrap();
        assert_eq!(seen, 1);
        assert_eq!(snap.pending(), &b[..5]);
        assert_eq!(snap.room(), a.len());
    }
}
