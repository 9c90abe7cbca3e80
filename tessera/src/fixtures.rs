//! Datasets for tests. Every row encodes its own index, so coverage and ordering can be
//! checked from the bytes alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rstest::fixture;
use tessera_error::{TesseraResult, tessera_err};
use tessera_io::{
    ColumnSelection, Dataset, DatasetSource, ElementType, Field, MemoryDataset, MemorySource,
    RowLayout,
};

pub const INDEXED: &str = "/indexed";
pub const TABLE: &str = "/table";

/// Rows of a single little-endian `u64` equal to the row index.
pub fn indexed(rows: u64) -> MemoryDataset {
    let data: Vec<u8> = (0..rows).flat_map(u64::to_le_bytes).collect();
    MemoryDataset::try_new(RowLayout::array(ElementType::U64, &[]), data).unwrap()
}

/// Rows of `{id: u64, square: u64}`.
pub fn table(rows: u64) -> MemoryDataset {
    let layout = RowLayout::table([
        Field::new("id", ElementType::U64, &[]),
        Field::new("square", ElementType::U64, &[]),
    ])
    .unwrap();
    let data: Vec<u8> = (0..rows)
        .flat_map(|i| i.to_le_bytes().into_iter().chain((i * i).to_le_bytes()))
        .collect();
    MemoryDataset::try_new(layout, data).unwrap()
}

pub fn value(row: &[u8]) -> u64 {
    u64::from_le_bytes(row[..8].try_into().unwrap())
}

pub fn values(bytes: &[u8]) -> Vec<u64> {
    bytes.chunks_exact(8).map(value).collect()
}

pub fn source(rows: u64) -> Arc<MemorySource> {
    Arc::new(
        MemorySource::new()
            .with_dataset(INDEXED, indexed(rows))
            .with_dataset(TABLE, table(rows)),
    )
}

#[fixture]
pub fn hundred() -> Arc<MemorySource> {
    source(100)
}

/// What a [`FaultySource`] does when a read touches its poisoned row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Fail,
    Panic,
}

/// Indexed rows whose reads fail or panic whenever they touch one row.
#[derive(Debug)]
pub struct FaultySource {
    pub rows: u64,
    pub poisoned: u64,
    pub fault: Fault,
}

impl DatasetSource for FaultySource {
    fn open(&self, _path: &str) -> TesseraResult<Box<dyn Dataset>> {
        Ok(Box::new(FaultyDataset {
            inner: indexed(self.rows),
            poisoned: self.poisoned,
            fault: self.fault,
        }))
    }
}

struct FaultyDataset {
    inner: MemoryDataset,
    poisoned: u64,
    fault: Fault,
}

impl Dataset for FaultyDataset {
    fn row_count(&self) -> u64 {
        self.inner.row_count()
    }

    fn layout(&self) -> &RowLayout {
        self.inner.layout()
    }

    fn chunk_rows(&self) -> Option<u64> {
        None
    }

    fn read_rows(
        &mut self,
        row_start: u64,
        row_count: u64,
        columns: &ColumnSelection,
        out: &mut [u8],
    ) -> TesseraResult<usize> {
        if (row_start..row_start + row_count).contains(&self.poisoned) {
            match self.fault {
                Fault::Fail => {
                    return Err(tessera_err!(DatasetRead: "row {} is corrupt", self.poisoned));
                }
                Fault::Panic => panic!("decoder crashed on row {}", self.poisoned),
            }
        }
        self.inner.read_rows(row_start, row_count, columns, out)
    }
}

/// A source that succeeds once for its geometry, then refuses to open.
#[derive(Debug, Default)]
pub struct OpenOnceSource {
    opened: Mutex<bool>,
}

impl DatasetSource for OpenOnceSource {
    fn open(&self, path: &str) -> TesseraResult<Box<dyn Dataset>> {
        let mut opened = self.opened.lock();
        if *opened {
            return Err(tessera_err!(DatasetRead: "{path} is no longer available"));
        }
        *opened = true;
        Ok(Box::new(indexed(40)))
    }
}

/// Indexed rows that keep count of the dataset handles still open.
#[derive(Debug)]
pub struct CountingSource {
    rows: u64,
    live: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn new(rows: u64) -> Self {
        Self {
            rows,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl DatasetSource for CountingSource {
    fn open(&self, _path: &str) -> TesseraResult<Box<dyn Dataset>> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedDataset {
            inner: indexed(self.rows),
            live: self.live.clone(),
        }))
    }
}

struct CountedDataset {
    inner: MemoryDataset,
    live: Arc<AtomicUsize>,
}

impl Drop for CountedDataset {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dataset for CountedDataset {
    fn row_count(&self) -> u64 {
        self.inner.row_count()
    }

    fn layout(&self) -> &RowLayout {
        self.inner.layout()
    }

    fn chunk_rows(&self) -> Option<u64> {
        None
    }

    fn read_rows(
        &mut self,
        row_start: u64,
        row_count: u64,
        columns: &ColumnSelection,
        out: &mut [u8],
    ) -> TesseraResult<usize> {
        self.inner.read_rows(row_start, row_count, columns, out)
    }
}

/// Indexed rows whose reads block on a gate per starting row.
#[derive(Debug)]
pub struct GatedSource {
    rows: u64,
    gates: Arc<Mutex<HashMap<u64, flume::Receiver<()>>>>,
    entered: flume::Sender<u64>,
    finished: flume::Sender<u64>,
}

/// The test's side of a [`GatedSource`].
pub struct Gates {
    pub source: Arc<GatedSource>,
    /// One sender per gated row, in the order given. Dropping it opens the gate.
    pub gates: Vec<flume::Sender<()>>,
    /// The starting row of every read as it begins.
    pub entered: flume::Receiver<u64>,
    /// The starting row of every read as it completes.
    pub finished: flume::Receiver<u64>,
}

impl GatedSource {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(rows: u64, gated: &[u64]) -> Gates {
        let mut receivers = HashMap::new();
        let gates = gated
            .iter()
            .map(|row| {
                let (tx, rx) = flume::bounded(0);
                receivers.insert(*row, rx);
                tx
            })
            .collect();
        let (entered_tx, entered) = flume::unbounded();
        let (finished_tx, finished) = flume::unbounded();
        let source = Arc::new(Self {
            rows,
            gates: Arc::new(Mutex::new(receivers)),
            entered: entered_tx,
            finished: finished_tx,
        });
        Gates {
            source,
            gates,
            entered,
            finished,
        }
    }
}

impl DatasetSource for GatedSource {
    fn open(&self, _path: &str) -> TesseraResult<Box<dyn Dataset>> {
        Ok(Box::new(GatedDataset {
            inner: indexed(self.rows),
            gates: self.gates.clone(),
            entered: self.entered.clone(),
            finished: self.finished.clone(),
        }))
    }
}

struct GatedDataset {
    inner: MemoryDataset,
    gates: Arc<Mutex<HashMap<u64, flume::Receiver<()>>>>,
    entered: flume::Sender<u64>,
    finished: flume::Sender<u64>,
}

impl Dataset for GatedDataset {
    fn row_count(&self) -> u64 {
        self.inner.row_count()
    }

    fn layout(&self) -> &RowLayout {
        self.inner.layout()
    }

    fn chunk_rows(&self) -> Option<u64> {
        None
    }

    fn read_rows(
        &mut self,
        row_start: u64,
        row_count: u64,
        columns: &ColumnSelection,
        out: &mut [u8],
    ) -> TesseraResult<usize> {
        let _ = self.entered.send(row_start);
        let gate = self.gates.lock().get(&row_start).cloned();
        if let Some(gate) = gate {
            // Either a send or the sender being dropped opens the gate.
            let _ = gate.recv();
        }
        let written = self.inner.read_rows(row_start, row_count, columns, out)?;
        let _ = self.finished.send(row_start);
        Ok(written)
    }
}
