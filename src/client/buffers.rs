// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Chunked byte queues sitting between the message layer and the socket.
//!
//! The send side is an ordered queue of chunks drained strictly in order; a
//! partial write rewrites the head chunk to its unsent tail.  The receive
//! side collects whatever the socket produced and hands the parser exactly
//! the shape it asked for: a line, a header block, n bytes, or everything.
//! Chunks are [`Bytes`], so carving and consolidation never copy more than
//! they must.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == CRLF)
}

/// Outbound chunk queue.
#[derive(Debug, Default)]
pub struct SendBuffer {
    chunks: VecDeque<Bytes>,
}

impl SendBuffer {
    pub fn push(&mut self, chunk: Bytes) {
        // Empty strings have no business in the buffer.
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    /// The chunk the next write must send (a prefix of it may go).
    pub fn head(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| c.as_ref())
    }

    /// Records that the head `sent` bytes reached the socket.
    pub fn advance(&mut self, sent: usize) {
        if let Some(mut head) = self.chunks.pop_front() {
            if sent < head.len() {
                // Partial write: keep the tail at the front of the queue.
                let _ = head.split_to(sent);
                self.chunks.push_front(head);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

/// Inbound segmented queue with a running total size.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
}

impl RecvBuffer {
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.size += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    /// Collapses the queue into a single chunk so that line scans see one
    /// contiguous slice.
    fn consolidate(&mut self) {
        if self.chunks.len() > 1 {
            let mut all = BytesMut::with_capacity(self.size);
            for chunk in self.chunks.drain(..) {
                all.extend_from_slice(&chunk);
            }
            self.chunks.push_back(all.freeze());
        }
    }

    /// Takes one CRLF-terminated line (including its CRLF), or `None` when
    /// no full line has arrived yet.
    pub fn take_line(&mut self) -> Option<Bytes> {
        self.consolidate();
        let pos = find_crlf(self.chunks.front()?)?;
        let mut head = self.chunks.pop_front()?;
        let line = head.split_to(pos + 2);
        self.size -= line.len();
        if !head.is_empty() {
            self.chunks.push_front(head);
        }
        Some(line)
    }

    /// Takes a complete header block split into CRLF-terminated lines, the
    /// blank terminator line included.
    ///
    /// A block starting with CRLF is an empty header set and yields just the
    /// blank line.  Otherwise the block must be terminated by CRLF CRLF;
    /// until that arrives the buffer is left untouched.
    pub fn take_header_block(&mut self) -> Option<Vec<Bytes>> {
        self.consolidate();
        let data = self.chunks.front()?;
        let first = find_crlf(data)?;
        let block_len = if first == 0 {
            2
        } else {
            let terminator = data
                .windows(4)
                .position(|w| w == b"\r\n\r\n")?;
            terminator + 4
        };
        let mut head = self.chunks.pop_front()?;
        let mut block = head.split_to(block_len);
        self.size -= block.len();
        if !head.is_empty() {
            self.chunks.push_front(head);
        }
        let mut lines = Vec::new();
        while !block.is_empty() {
            match find_crlf(&block) {
                Some(pos) => lines.push(block.split_to(pos + 2)),
                None => {
                    // Unreachable for a CRLF-terminated block; keep the
                    // remainder as a final line rather than dropping bytes.
                    lines.push(block.split_to(block.len()));
                },
            }
        }
        Some(lines)
    }

    /// Extracts exactly `count` bytes, splitting the straddling chunk.  The
    /// caller must have checked `len() >= count`.
    pub fn extract(&mut self, count: usize) -> Bytes {
        debug_assert!(self.size >= count);
        // Fast path: the head chunk alone covers the request.
        if self.chunks.front().is_some_and(|head| head.len() >= count)
            && let Some(mut head) = self.chunks.pop_front()
        {
            let out = head.split_to(count);
            if !head.is_empty() {
                self.chunks.push_front(head);
            }
            self.size -= count;
            return out;
        }
        let mut out = BytesMut::with_capacity(count);
        let mut need = count;
        while need > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            if chunk.len() <= need {
                need -= chunk.len();
                out.extend_from_slice(&chunk);
            } else {
                out.extend_from_slice(&chunk.split_to(need));
                self.chunks.push_front(chunk);
                need = 0;
            }
        }
        self.size -= out.len();
        out.freeze()
    }

    /// Empties the queue into one chunk, for read-until-close deliveries.
    pub fn drain_all(&mut self) -> Bytes {
        self.consolidate();
        self.size = 0;
        self.chunks.pop_front().unwrap_or_else(Bytes::new)
    }
}
