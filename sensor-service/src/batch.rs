//! Block pool that absorbs HAL callbacks between dispatch passes
//!
//! # Overview
//!
//! The HAL thread pushes one [`EventFrame`] at a time into the current write
//! block. When a block fills, writing moves on to the next one, allocating
//! it on first use up to the configured block count. The report worker
//! calls [`EventBatchBuffer::drain`], which takes every written block at
//! once and hands the frames back in arrival order.
//!
//! # Retention
//!
//! Each non-empty drain records how many blocks it used. Blocks beyond the
//! largest count in that short history are released, so a burst grows the
//! pool only until traffic settles again. One block is always kept.

use std::collections::VecDeque;

use parking_lot::Mutex;
use sensor_channel::EventFrame;

use crate::error::{BrokerError, Result};

#[derive(Debug)]
struct Pool {
    blocks: Vec<Vec<EventFrame>>,
    write: usize,
    history: VecDeque<usize>,
}

/// Fixed pool of fixed-capacity frame blocks
#[derive(Debug)]
pub struct EventBatchBuffer {
    pool: Mutex<Pool>,
    block_count: usize,
    block_capacity: usize,
    history_len: usize,
}

impl EventBatchBuffer {
    pub fn new(block_count: usize, block_capacity: usize, history_len: usize) -> Self {
        let block_count = block_count.max(1);
        let block_capacity = block_capacity.max(1);
        Self {
            pool: Mutex::new(Pool {
                blocks: vec![Vec::with_capacity(block_capacity)],
                write: 0,
                history: VecDeque::with_capacity(history_len.max(1)),
            }),
            block_count,
            block_capacity,
            history_len: history_len.max(1),
        }
    }

    /// Append a frame to the current write block
    ///
    /// Fails with `ResourceExhausted` when every block is full and undrained.
    pub fn push(&self, frame: EventFrame) -> Result<()> {
        let mut pool = self.pool.lock();
        let write = pool.write;
        if pool.blocks[write].len() < self.block_capacity {
            pool.blocks[write].push(frame);
            return Ok(());
        }
        let next = write + 1;
        if next >= self.block_count {
            return Err(BrokerError::ResourceExhausted(format!(
                "all {} batch blocks are full",
                self.block_count
            )));
        }
        if next == pool.blocks.len() {
            pool.blocks.push(Vec::with_capacity(self.block_capacity));
        }
        pool.write = next;
        pool.blocks[next].push(frame);
        Ok(())
    }

    /// Take every written frame, oldest first, and reset the pool
    pub fn drain(&self) -> Vec<EventFrame> {
        let taken: Vec<Vec<EventFrame>> = {
            let mut pool = self.pool.lock();
            let used = pool.write + 1;
            if pool.blocks[0].is_empty() {
                return Vec::new();
            }
            pool.write = 0;
            pool.blocks[..used]
                .iter_mut()
                .map(|block| std::mem::replace(block, Vec::new()))
                .collect()
        };

        let used = taken.len();
        let mut frames = Vec::with_capacity(used * self.block_capacity);
        let mut emptied = Vec::with_capacity(used);
        for mut block in taken {
            frames.append(&mut block);
            emptied.push(block);
        }

        let mut pool = self.pool.lock();
        // Blocks written while the lock was released stay in place; only
        // slots that are still empty get their storage back.
        for (slot, block) in pool.blocks.iter_mut().zip(emptied) {
            if slot.is_empty() && slot.capacity() == 0 {
                *slot = block;
            }
        }
        if pool.history.len() == self.history_len {
            pool.history.pop_front();
        }
        pool.history.push_back(used);
        let keep = pool.history.iter().copied().max().unwrap_or(1).max(1);
        let keep = keep.max(pool.write + 1);
        if pool.blocks.len() > keep {
            tracing::trace!(from = pool.blocks.len(), to = keep, "Releasing surplus batch blocks");
            pool.blocks.truncate(keep);
        }
        for block in pool.blocks.iter_mut() {
            if block.capacity() == 0 {
                block.reserve_exact(self.block_capacity);
            }
        }
        frames
    }

    /// Blocks currently backed by storage
    pub fn allocated_blocks(&self) -> usize {
        self.pool.lock().blocks.len()
    }

    /// Frames waiting for the next drain
    pub fn pending(&self) -> usize {
        let pool = self.pool.lock();
        pool.blocks[..=pool.write].iter().map(Vec::len).sum()
    }

    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }
}
