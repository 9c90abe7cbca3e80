use std::sync::Arc;

use bytes::Bytes;
use tessera_error::TesseraResult;
use tessera_io::{DatasetSource, SharedArena};

use crate::{OwnedRows, SlotGuard, StreamOptions, StreamQueue};

/// Settings of a [`RowGenerator`].
#[derive(Debug, Clone)]
pub struct RowGeneratorOptions {
    pub stream: StreamOptions,
    /// Yield the remainder rows once the blocks are exhausted. Ignored for cyclic streams.
    pub include_remainder: bool,
}

impl Default for RowGeneratorOptions {
    fn default() -> Self {
        Self {
            stream: StreamOptions::default(),
            include_remainder: true,
        }
    }
}

enum Phase {
    Blocks,
    Remainder,
    Done,
}

/// Yields the rows of a stream one at a time as owned bytes.
///
/// Each slot is held only until its last row has been copied out.
pub struct RowGenerator {
    queue: StreamQueue,
    include_remainder: bool,
    phase: Phase,
    block: Option<(SlotGuard, usize)>,
    tail: Option<(OwnedRows, usize)>,
}

impl RowGenerator {
    pub fn new(queue: StreamQueue, include_remainder: bool) -> Self {
        Self {
            queue,
            include_remainder,
            phase: Phase::Blocks,
            block: None,
            tail: None,
        }
    }

    pub fn open(
        source: Arc<dyn DatasetSource>,
        arena: &dyn SharedArena,
        path: &str,
        options: RowGeneratorOptions,
    ) -> TesseraResult<Self> {
        let queue = StreamQueue::open(source, arena, path, options.stream)?;
        Ok(Self::new(queue, options.include_remainder))
    }

    pub fn queue(&self) -> &StreamQueue {
        &self.queue
    }

    /// Releases any held slot and closes the underlying stream.
    pub fn close(&mut self, wait: bool) {
        self.block = None;
        self.tail = None;
        self.phase = Phase::Done;
        self.queue.close(wait);
    }

    fn next_block_row(&mut self) -> Option<Bytes> {
        let (guard, cursor) = self.block.as_mut()?;
        let row = guard.row(*cursor).map(Bytes::copy_from_slice);
        *cursor += 1;
        if row.is_none() || *cursor >= guard.rows() {
            self.block = None;
        }
        row
    }

    fn next_tail_row(&mut self) -> Option<Bytes> {
        let (rows, cursor) = self.tail.as_mut()?;
        let row = rows.row(*cursor);
        *cursor += 1;
        if row.is_none() {
            self.tail = None;
        }
        row
    }
}

impl Iterator for RowGenerator {
    type Item = TesseraResult<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.next_block_row() {
                return Some(Ok(row));
            }
            match self.phase {
                Phase::Blocks => match self.queue.get() {
                    Ok(Some(guard)) => self.block = Some((guard, 0)),
                    Ok(None) => self.phase = Phase::Remainder,
                    Err(err) => return Some(Err(err)),
                },
                Phase::Remainder => {
                    self.phase = Phase::Done;
                    if self.include_remainder && !self.queue.is_cyclic() {
                        match self.queue.remainder() {
                            Ok(rows) => self.tail = rows.map(|rows| (rows, 0)),
                            Err(err) => return Some(Err(err)),
                        }
                    }
                }
                Phase::Done => return self.next_tail_row().map(Ok),
            }
        }
    }
}
