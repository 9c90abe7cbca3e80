//! A bounded set of shared-memory slots passed between writers and a consumer.
//!
//! Every slot is in exactly one of four states at any time: on the free list, being filled by
//! a [`SlotWriter`], on the ready list, or being read through a [`SlotGuard`]. Both lists live
//! under one mutex, so publishing a slot happens-before any consumer observes it.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tessera_error::{TesseraError, TesseraResult, tessera_bail};
use tessera_io::{SharedArena, SharedRegion};

use crate::RowsView;

/// Describes the rows a published slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The block index within the dataset.
    pub index: u64,
    /// The number of rows written.
    pub rows: usize,
    /// The number of bytes written.
    pub nbytes: usize,
}

/// A count of slots by state. The counts always sum to the number of slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub free: usize,
    pub ready: usize,
    pub writing: usize,
    pub reading: usize,
}

impl Occupancy {
    pub fn total(&self) -> usize {
        self.free + self.ready + self.writing + self.reading
    }
}

struct ReadyEntry {
    slot: usize,
    seq: u64,
    outcome: Result<BlockInfo, TesseraError>,
}

struct SlotState {
    free: VecDeque<usize>,
    ready: VecDeque<ReadyEntry>,
    writing: usize,
    reading: usize,
    generations: Vec<u64>,
    // The next sequence number allowed to take a free slot, when grants are ordered.
    next_grant: u64,
    writers: usize,
    exhausted: bool,
    closed: bool,
    fault: Option<TesseraError>,
}

/// A fixed number of equally sized shared-memory slots with a free list and a ready list.
pub struct SlotBuffer {
    slots: Box<[SharedRegion]>,
    slot_nbytes: usize,
    row_nbytes: usize,
    ordered_grants: bool,
    state: Mutex<SlotState>,
    free_cv: Condvar,
    ready_cv: Condvar,
}

impl SlotBuffer {
    /// Allocates `count` slots of `slot_nbytes` bytes each from `arena`.
    ///
    /// With `ordered_grants`, writers are handed free slots strictly in sequence-number order,
    /// which guarantees that a consumer reordering blocks can always make progress.
    pub fn try_new(
        arena: &dyn SharedArena,
        count: usize,
        slot_nbytes: usize,
        row_nbytes: usize,
        ordered_grants: bool,
    ) -> TesseraResult<Arc<Self>> {
        if count == 0 {
            tessera_bail!("a slot buffer needs at least one slot");
        }
        let slots = (0..count)
            .map(|_| arena.allocate(slot_nbytes))
            .collect::<TesseraResult<Box<[_]>>>()?;

        Ok(Arc::new(Self {
            slots,
            slot_nbytes,
            row_nbytes,
            ordered_grants,
            state: Mutex::new(SlotState {
                free: (0..count).collect(),
                ready: VecDeque::with_capacity(count),
                writing: 0,
                reading: 0,
                generations: vec![0; count],
                next_grant: 0,
                writers: 0,
                exhausted: false,
                closed: false,
                fault: None,
            }),
            free_cv: Condvar::new(),
            ready_cv: Condvar::new(),
        }))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_nbytes(&self) -> usize {
        self.slot_nbytes
    }

    /// Registers a writer. The buffer is exhausted once every registered writer is dropped.
    pub fn writer(self: &Arc<Self>) -> WriterHandle {
        let mut state = self.state.lock();
        state.writers += 1;
        state.exhausted = false;
        WriterHandle {
            buffer: self.clone(),
        }
    }

    /// Blocks until a block is ready.
    ///
    /// Returns `Ok(None)` once the buffer is closed or every writer has finished and the ready
    /// list is drained. A block whose writer failed surfaces as `Err`.
    pub fn acquire_ready(self: &Arc<Self>) -> TesseraResult<Option<SlotGuard>> {
        match self.next_ready()? {
            Some((_, block)) => block.map(Some),
            None => Ok(None),
        }
    }

    /// Like [`acquire_ready`][Self::acquire_ready], but also returns the sequence number the
    /// writer published the block under. The outer error is a fault that poisoned the buffer.
    pub(crate) fn next_ready(
        self: &Arc<Self>,
    ) -> TesseraResult<Option<(u64, TesseraResult<SlotGuard>)>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return match state.fault.take() {
                    Some(fault) => Err(fault),
                    None => Ok(None),
                };
            }
            if let Some(entry) = state.ready.pop_front() {
                return Ok(Some(match entry.outcome {
                    Ok(block) => {
                        state.reading += 1;
                        let guard = SlotGuard {
                            buffer: self.clone(),
                            slot: entry.slot,
                            generation: state.generations[entry.slot],
                            block,
                        };
                        (entry.seq, Ok(guard))
                    }
                    Err(err) => {
                        state.free.push_back(entry.slot);
                        drop(state);
                        self.free_cv.notify_all();
                        (entry.seq, Err(err))
                    }
                }));
            }
            if state.exhausted {
                return Ok(None);
            }
            self.ready_cv.wait(&mut state);
        }
    }

    /// Closes the buffer, returning every ready slot to the free list and waking all waiters.
    ///
    /// Writers still filling a slot may finish, but their blocks are discarded. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        while let Some(entry) = state.ready.pop_front() {
            state.free.push_back(entry.slot);
        }
        drop(state);
        self.free_cv.notify_all();
        self.ready_cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn occupancy(&self) -> Occupancy {
        let state = self.state.lock();
        Occupancy {
            free: state.free.len(),
            ready: state.ready.len(),
            writing: state.writing,
            reading: state.reading,
        }
    }

    fn release_read(&self, slot: usize, generation: u64) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            state.generations[slot], generation,
            "slot {slot} released by a stale guard"
        );
        state.generations[slot] = generation.wrapping_add(1);
        state.reading -= 1;
        state.free.push_back(slot);
        drop(state);
        self.free_cv.notify_all();
    }
}

impl Debug for SlotBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotBuffer")
            .field("slots", &self.slots.len())
            .field("slot_nbytes", &self.slot_nbytes)
            .field("occupancy", &self.occupancy())
            .finish()
    }
}

/// A registered writer of a [`SlotBuffer`]. Dropping the last one exhausts the buffer.
pub struct WriterHandle {
    buffer: Arc<SlotBuffer>,
}

impl WriterHandle {
    /// Blocks until a free slot can be granted to the block with sequence number `seq`.
    ///
    /// Returns `None` once the buffer is closed.
    pub fn acquire_free(&self, seq: u64) -> Option<SlotWriter> {
        let buffer = &self.buffer;
        let mut state = buffer.state.lock();
        loop {
            if state.closed {
                return None;
            }
            let turn = !buffer.ordered_grants || state.next_grant == seq;
            if let Some(slot) = turn.then(|| state.free.pop_front()).flatten() {
                state.writing += 1;
                if buffer.ordered_grants {
                    state.next_grant += 1;
                    drop(state);
                    buffer.free_cv.notify_all();
                }
                return Some(SlotWriter {
                    buffer: buffer.clone(),
                    slot,
                    seq,
                    finished: false,
                });
            }
            buffer.free_cv.wait(&mut state);
        }
    }

    /// Poisons the buffer with a fault that the consumer observes once, then closes it.
    pub fn fault(&self, err: TesseraError) {
        let mut state = self.buffer.state.lock();
        if state.fault.is_none() && !state.closed {
            state.fault = Some(err);
        }
        drop(state);
        self.buffer.close();
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        let mut state = self.buffer.state.lock();
        state.writers -= 1;
        if state.writers == 0 {
            state.exhausted = true;
            drop(state);
            self.buffer.ready_cv.notify_all();
        }
    }
}

/// Exclusive write access to one free slot.
///
/// Dropping the writer without publishing returns the slot to the free list.
pub struct SlotWriter {
    buffer: Arc<SlotBuffer>,
    slot: usize,
    seq: u64,
    finished: bool,
}

impl SlotWriter {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the slot was taken off the free list for this writer and is on no other list
        // until the writer finishes.
        unsafe { self.buffer.slots[self.slot].as_mut_slice() }
    }

    /// Moves the slot to the ready list.
    pub fn publish(mut self, block: BlockInfo) {
        debug_assert!(block.nbytes <= self.buffer.slot_nbytes);
        self.finish(Some(Ok(block)));
    }

    /// Moves the slot to the ready list flagged with an error, so the consumer sees the failure
    /// instead of the slot contents.
    pub fn publish_error(mut self, err: TesseraError) {
        self.finish(Some(Err(err)));
    }

    fn finish(&mut self, outcome: Option<Result<BlockInfo, TesseraError>>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let buffer = &self.buffer;
        let mut state = buffer.state.lock();
        state.writing -= 1;
        match outcome {
            Some(outcome) if !state.closed => {
                state.ready.push_back(ReadyEntry {
                    slot: self.slot,
                    seq: self.seq,
                    outcome,
                });
                drop(state);
                buffer.ready_cv.notify_one();
            }
            _ => {
                state.free.push_back(self.slot);
                drop(state);
                buffer.free_cv.notify_all();
            }
        }
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        self.finish(None);
    }
}

/// Read access to one ready slot. The slot returns to the free list when the guard is released
/// or dropped; views borrowed from the guard cannot outlive it.
pub struct SlotGuard {
    buffer: Arc<SlotBuffer>,
    slot: usize,
    generation: u64,
    block: BlockInfo,
}

impl SlotGuard {
    pub fn block(&self) -> BlockInfo {
        self.block
    }

    pub fn block_index(&self) -> u64 {
        self.block.index
    }

    pub fn rows(&self) -> usize {
        self.block.rows
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the slot is checked out to this guard, no writer holds it until release.
        let region = unsafe { self.buffer.slots[self.slot].as_slice() };
        &region[..self.block.nbytes]
    }

    pub fn view(&self) -> RowsView<'_> {
        RowsView::new(self.bytes(), self.buffer.row_nbytes)
    }

    pub fn row(&self, idx: usize) -> Option<&[u8]> {
        self.view().row(idx)
    }

    /// Returns the slot to the free list.
    pub fn release(self) {}
}

impl Debug for SlotGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("slot", &self.slot)
            .field("block", &self.block)
            .finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.buffer.release_read(self.slot, self.generation);
    }
}
