use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tessera_error::{TesseraResult, tessera_bail, tessera_err};
use tessera_io::{ColumnSelection, Dataset, DatasetInfo, DatasetSource, SharedArena};
use tessera_metrics::{StreamMetrics, TesseraMetrics};

use crate::plan::default_block_size;
use crate::worker::panic_message;
use crate::{
    BlockInfo, BlockPlan, Occupancy, OwnedRows, SlotBuffer, SlotGuard, WorkerPool, WriterHandle,
};

/// Construction-time settings of a [`StreamQueue`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Number of worker threads, each with its own dataset handle.
    pub n_procs: usize,
    /// Number of slots. Defaults to `2 * n_procs + 1`.
    pub read_ahead: Option<usize>,
    /// Wrap around the end of the dataset forever.
    pub cyclic: bool,
    /// Rows per block. Defaults to the dataset chunk size, or as many rows as fit 128 KiB.
    pub block_size: Option<u64>,
    /// Deliver blocks in dataset order.
    ///
    /// Slots are then granted to workers strictly in block order and early blocks wait in a
    /// side table, so a slow block holds back every block behind it. Expect lower throughput.
    pub ordered: bool,
    /// Deliver the rows left over after the last full block as one final, shorter block.
    /// Ignored for cyclic streams.
    pub remainder: bool,
    pub columns: ColumnSelection,
    pub metrics: TesseraMetrics,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            n_procs: 4,
            read_ahead: None,
            cyclic: false,
            block_size: None,
            ordered: false,
            remainder: false,
            columns: ColumnSelection::All,
            metrics: TesseraMetrics::default(),
        }
    }
}

/// What every stream worker shares.
struct StreamWork {
    source: Arc<dyn DatasetSource>,
    path: Arc<str>,
    plan: BlockPlan,
    columns: ColumnSelection,
    n_procs: usize,
    metrics: StreamMetrics,
}

#[derive(Default)]
struct Reorder {
    next_seq: u64,
    pending: BTreeMap<u64, TesseraResult<SlotGuard>>,
}

/// Streams the blocks of one dataset through a bounded set of shared-memory slots.
///
/// Worker `i` of `n` fills blocks `i`, `i + n`, `i + 2n` and so on, each through its own
/// dataset handle. The consumer takes filled blocks with [`get`][Self::get] or
/// [`iter`][Self::iter] and hands each slot back by dropping its [`SlotGuard`].
pub struct StreamQueue {
    info: DatasetInfo,
    plan: BlockPlan,
    columns: ColumnSelection,
    row_nbytes: usize,
    n_procs: usize,
    read_ahead: usize,
    source: Arc<dyn DatasetSource>,
    buffer: Arc<SlotBuffer>,
    workers: Mutex<Option<WorkerPool>>,
    reorder: Option<Mutex<Reorder>>,
    closed: AtomicBool,
    metrics: StreamMetrics,
}

impl StreamQueue {
    /// Reads the geometry of the dataset at `path`, allocates the slots and starts the workers.
    pub fn open(
        source: Arc<dyn DatasetSource>,
        arena: &dyn SharedArena,
        path: &str,
        options: StreamOptions,
    ) -> TesseraResult<Self> {
        let StreamOptions {
            n_procs,
            read_ahead,
            cyclic,
            block_size,
            ordered,
            remainder,
            columns,
            metrics,
        } = options;
        if n_procs == 0 {
            tessera_bail!("a stream needs at least one worker");
        }
        let read_ahead = read_ahead.unwrap_or(2 * n_procs + 1);
        if read_ahead == 0 {
            tessera_bail!("a stream needs at least one slot");
        }

        let info = DatasetInfo::load(source.as_ref(), path)?;
        let row_nbytes = info.layout().selection_nbytes(&columns)?;
        if row_nbytes == 0 {
            tessera_bail!("the selected columns of {path} are empty");
        }
        let block_size = block_size.unwrap_or_else(|| default_block_size(&info, row_nbytes));
        let plan =
            BlockPlan::new(info.row_count(), block_size, cyclic)?.with_remainder_block(remainder);
        let slot_nbytes = usize::try_from(plan.block_size())
            .ok()
            .and_then(|rows| rows.checked_mul(row_nbytes))
            .ok_or_else(|| {
                tessera_err!(OutOfBounds: "blocks of {} rows do not fit in memory", plan.block_size())
            })?;

        let buffer = SlotBuffer::try_new(arena, read_ahead, slot_nbytes, row_nbytes, ordered)?;
        let metrics = metrics.stream();
        let work = Arc::new(StreamWork {
            source: source.clone(),
            path: info.path().clone(),
            plan,
            columns: columns.clone(),
            n_procs,
            metrics: metrics.clone(),
        });
        let writers: Vec<WriterHandle> = (0..n_procs).map(|_| buffer.writer()).collect();
        let workers = WorkerPool::spawn("tessera-stream", writers, move |idx, writer| {
            run_worker(&work, idx, writer)
        })
        .inspect_err(|_| buffer.close())?;
        log::debug!(
            "streaming {path}: {} blocks of {} rows, {n_procs} workers, {read_ahead} slots",
            plan.total_blocks(),
            plan.block_size(),
        );

        Ok(Self {
            info,
            plan,
            columns,
            row_nbytes,
            n_procs,
            read_ahead,
            source,
            buffer,
            workers: Mutex::new(Some(workers)),
            reorder: ordered.then(|| Mutex::new(Reorder::default())),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Blocks until the next block is ready.
    ///
    /// Returns `Ok(None)` once the stream is exhausted or closed. A block the worker failed to
    /// read is returned as `Err` and the stream carries on with the next block, except for
    /// worker faults, after which the stream is closed.
    pub fn get(&self) -> TesseraResult<Option<SlotGuard>> {
        let _timer = self.metrics.acquire_ready.time();
        let block = match &self.reorder {
            None => self.buffer.acquire_ready(),
            Some(reorder) => self.next_in_order(&mut reorder.lock()),
        };
        if let Ok(Some(_)) = &block {
            self.metrics.delivered.inc();
        }
        block
    }

    fn next_in_order(&self, reorder: &mut Reorder) -> TesseraResult<Option<SlotGuard>> {
        loop {
            let expected = reorder.next_seq;
            if let Some(block) = reorder.pending.remove(&expected) {
                reorder.next_seq += 1;
                return block.map(Some);
            }
            match self.buffer.next_ready() {
                Ok(Some((seq, block))) if seq == expected => {
                    reorder.next_seq += 1;
                    return block.map(Some);
                }
                Ok(Some((seq, block))) => {
                    self.metrics.reordered.inc();
                    reorder.pending.insert(seq, block);
                    self.metrics.reorder_depth.update(reorder.pending.len() as i64);
                }
                other => {
                    reorder.pending.clear();
                    return other.map(|_| None);
                }
            }
        }
    }

    /// A single pass over the remaining blocks, ending when [`get`][Self::get] returns `None`.
    ///
    /// A cyclic stream never ends on its own.
    pub fn iter(&self) -> StreamIter<'_> {
        StreamIter {
            queue: self,
            done: false,
        }
    }

    /// Reads the trailing rows that no block covers, if any.
    ///
    /// Only non-cyclic streams have a remainder. Cyclic streams fold it into a wraparound block,
    /// and streams opened with [`StreamOptions::remainder`] deliver it as their last block.
    pub fn remainder(&self) -> TesseraResult<Option<OwnedRows>> {
        if self.is_closed() {
            tessera_bail!(Closed: "stream over {} is closed", self.info.path());
        }
        read_remainder(self.source.as_ref(), &self.info, &self.plan, &self.columns)
    }

    /// Stops the workers and wakes every blocked consumer. With `wait`, also blocks until every
    /// worker thread has exited. Idempotent.
    pub fn close(&self, wait: bool) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("closing stream over {}", self.info.path());
        }
        self.buffer.close();
        if let Some(reorder) = &self.reorder {
            if let Some(mut reorder) = reorder.try_lock() {
                reorder.pending.clear();
            }
        }
        if wait {
            if let Some(workers) = self.workers.lock().take() {
                workers.join();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether every worker thread has exited. Does not wait for them.
    pub fn is_finished(&self) -> bool {
        self.workers
            .lock()
            .as_ref()
            .is_none_or(WorkerPool::is_finished)
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    pub fn plan(&self) -> &BlockPlan {
        &self.plan
    }

    pub fn block_size(&self) -> u64 {
        self.plan.block_size()
    }

    pub fn total_blocks(&self) -> u64 {
        self.plan.total_blocks()
    }

    pub fn n_procs(&self) -> usize {
        self.n_procs
    }

    pub fn read_ahead(&self) -> usize {
        self.read_ahead
    }

    pub fn is_cyclic(&self) -> bool {
        self.plan.is_cyclic()
    }

    pub fn is_ordered(&self) -> bool {
        self.reorder.is_some()
    }

    pub fn columns(&self) -> &ColumnSelection {
        &self.columns
    }

    /// Bytes per row under the column selection.
    pub fn row_nbytes(&self) -> usize {
        self.row_nbytes
    }

    pub fn occupancy(&self) -> Occupancy {
        self.buffer.occupancy()
    }
}

impl Debug for StreamQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamQueue")
            .field("path", self.info.path())
            .field("plan", &self.plan)
            .field("n_procs", &self.n_procs)
            .field("read_ahead", &self.read_ahead)
            .field("ordered", &self.is_ordered())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for StreamQueue {
    fn drop(&mut self) {
        self.close(true);
    }
}

impl<'a> IntoIterator for &'a StreamQueue {
    type Item = TesseraResult<SlotGuard>;
    type IntoIter = StreamIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`StreamQueue::iter`].
pub struct StreamIter<'a> {
    queue: &'a StreamQueue,
    done: bool,
}

impl Iterator for StreamIter<'_> {
    type Item = TesseraResult<SlotGuard>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.queue.get() {
            Ok(Some(guard)) => Some(Ok(guard)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Reads the remainder of a non-cyclic plan through a fresh dataset handle.
pub(crate) fn read_remainder(
    source: &dyn DatasetSource,
    info: &DatasetInfo,
    plan: &BlockPlan,
    columns: &ColumnSelection,
) -> TesseraResult<Option<OwnedRows>> {
    let Some(span) = plan.remainder() else {
        return Ok(None);
    };
    let row_nbytes = info.layout().selection_nbytes(columns)?;
    let mut dataset = source.open(info.path())?;
    // The remainder is shorter than a block, which already fits in memory.
    let mut out = vec![0u8; span.rows as usize * row_nbytes];
    let written = dataset.read_rows(span.start, span.rows, columns, &mut out)?;
    out.truncate(written);

    let mut shape = info.shape(columns)?;
    if let Some(rows) = shape.first_mut() {
        *rows = span.rows;
    }
    Ok(Some(OwnedRows::new(Bytes::from(out), row_nbytes, shape)))
}

fn run_worker(work: &StreamWork, worker: usize, writer: WriterHandle) {
    let outcome = catch_unwind(AssertUnwindSafe(|| fill_blocks(work, worker, &writer)));
    let fault = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(payload) => tessera_err!(
            WorkerPanic: "stream worker {worker} over {}: {}",
            work.path,
            panic_message(payload.as_ref())
        ),
    };
    log::warn!("stream worker {worker} over {} failed: {fault}", work.path);
    writer.fault(fault);
}

fn fill_blocks(work: &StreamWork, worker: usize, writer: &WriterHandle) -> TesseraResult<()> {
    let mut dataset = work.source.open(&work.path)?;
    log::debug!("stream worker {worker} opened {}", work.path);

    let mut seq = worker as u64;
    while work.plan.is_cyclic() || seq < work.plan.total_blocks() {
        let Some(mut slot) = writer.acquire_free(seq) else {
            log::debug!("stream worker {worker} over {} stopped", work.path);
            return Ok(());
        };
        let index = work.plan.block_index(seq);
        let read = {
            let _timer = work.metrics.block_read.time();
            read_block(dataset.as_mut(), work, index, slot.as_mut_slice())
        };
        let read = read.map_err(|err| err.with_context(format!("block {index} of {}", work.path)));
        match read {
            Ok(block) => {
                log::trace!("stream worker {worker} published block {index} as {seq}");
                work.metrics.published.inc();
                slot.publish(block);
            }
            Err(err) => {
                log::warn!("{err}");
                work.metrics.failed.inc();
                slot.publish_error(err);
            }
        }
        seq += work.n_procs as u64;
    }
    log::debug!("stream worker {worker} over {} exhausted", work.path);
    Ok(())
}

fn read_block(
    dataset: &mut dyn Dataset,
    work: &StreamWork,
    index: u64,
    out: &mut [u8],
) -> TesseraResult<BlockInfo> {
    let mut nbytes = 0;
    let mut rows = 0;
    for span in work.plan.spans(index) {
        nbytes += dataset.read_rows(span.start, span.rows, &work.columns, &mut out[nbytes..])?;
        rows += span.rows;
    }
    Ok(BlockInfo {
        index,
        rows: rows as usize,
        nbytes,
    })
}
