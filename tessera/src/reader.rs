use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tessera_error::{TesseraError, TesseraResult, tessera_bail, tessera_err};
use tessera_io::{Dataset, DatasetInfo, DatasetSource, SharedArena};
use tessera_metrics::{ReaderMetrics, TesseraMetrics};

use crate::future::Completion;
use crate::request::ResolvedRequest;
use crate::worker::panic_message;
use crate::{DatasetHandle, Request, RequestFuture, StageTarget, WorkerPool};

/// Called with the request id and outcome each time a request resolves, on the thread that
/// resolved it.
pub type NotifyFn = Arc<dyn Fn(u64, Result<(), &TesseraError>) + Send + Sync>;

/// Construction-time settings of a [`Reader`].
#[derive(Clone)]
pub struct ReaderOptions {
    /// Number of worker threads serving requests.
    pub n_procs: usize,
    pub metrics: TesseraMetrics,
    /// Runs once per request after its future has been resolved. A panicking hook is logged and
    /// otherwise ignored.
    pub notify: Option<NotifyFn>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            n_procs: 4,
            metrics: TesseraMetrics::default(),
            notify: None,
        }
    }
}

impl Debug for ReaderOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("n_procs", &self.n_procs)
            .field("metrics", &self.metrics)
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

struct ReaderShared {
    source: Arc<dyn DatasetSource>,
    stopped: AtomicBool,
    metrics: ReaderMetrics,
    notify: Option<NotifyFn>,
}

/// One request on its way to a worker.
struct ReadTask {
    completion: Arc<Completion>,
    request: Request,
    resolved: ResolvedRequest,
}

impl Drop for ReadTask {
    fn drop(&mut self) {
        // Only takes effect if no worker completed the task.
        self.completion.complete(Err(tessera_err!(
            Closed: "request {} was dropped by a closed reader",
            self.completion.id()
        )));
    }
}

/// Serves random-access [`Request`]s on a pool of worker threads.
///
/// Requests are queued to whichever worker is free next. Each worker keeps its own dataset
/// handle per path and writes results straight into the stage leased for the request.
pub struct Reader {
    shared: Arc<ReaderShared>,
    arena: Arc<dyn SharedArena>,
    sender: Mutex<Option<flume::Sender<ReadTask>>>,
    receiver: flume::Receiver<ReadTask>,
    workers: Mutex<Option<WorkerPool>>,
    next_id: AtomicU64,
    n_procs: usize,
}

impl Reader {
    pub fn new(
        source: Arc<dyn DatasetSource>,
        arena: Arc<dyn SharedArena>,
        options: ReaderOptions,
    ) -> TesseraResult<Self> {
        let ReaderOptions {
            n_procs,
            metrics,
            notify,
        } = options;
        if n_procs == 0 {
            tessera_bail!("a reader needs at least one worker");
        }
        let shared = Arc::new(ReaderShared {
            source,
            stopped: AtomicBool::new(false),
            metrics: metrics.reader(),
            notify,
        });
        let (sender, receiver) = flume::unbounded();
        let workers = {
            let shared = shared.clone();
            let inputs = vec![receiver.clone(); n_procs];
            WorkerPool::spawn("tessera-reader", inputs, move |idx, rx| {
                serve(&shared, idx, rx)
            })?
        };

        Ok(Self {
            shared,
            arena,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Some(workers)),
            next_id: AtomicU64::new(0),
            n_procs,
        })
    }

    /// Opens a handle for building requests and stages against the dataset at `path`.
    pub fn dataset(&self, path: &str) -> TesseraResult<DatasetHandle<'_>> {
        let info = DatasetInfo::load(self.shared.source.as_ref(), path)?;
        Ok(DatasetHandle::new(self, info))
    }

    /// Schedules `request` into a stage leased from `target` and returns without waiting.
    ///
    /// Fails straight away if the selection lies outside the dataset, if the result cannot fit
    /// the target's stages, or if the reader is closed. Blocks only while a stage pool has no
    /// free stage.
    pub fn request(
        &self,
        request: &Request,
        target: &dyn StageTarget,
    ) -> TesseraResult<RequestFuture> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| tessera_err!(Closed: "reader is closed"))?;
        let resolved = request.resolve()?;
        let lease = target.lease(resolved.nbytes)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let completion = Arc::new(Completion::new(
            id,
            resolved.shape.clone(),
            resolved.row_nbytes,
            resolved.nbytes,
            lease,
            self.shared.notify.clone(),
        ));
        let task = ReadTask {
            completion: completion.clone(),
            request: request.clone(),
            resolved,
        };
        sender
            .send(task)
            .map_err(|_| tessera_err!(Closed: "reader is closed"))?;
        self.shared.metrics.submitted.inc();
        log::trace!("scheduled request {id} on {}", request.path());

        Ok(RequestFuture::new(completion))
    }

    /// Stops accepting requests. Requests already scheduled are still served. With `wait`, also
    /// blocks until every worker has exited. Idempotent.
    pub fn close(&self, wait: bool) {
        if self.sender.lock().take().is_some() {
            log::debug!("closing reader");
        }
        if wait {
            if let Some(workers) = self.workers.lock().take() {
                workers.join();
            }
        }
    }

    /// Shuts down immediately: requests not yet picked up by a worker fail with `Closed`.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.sender.lock().take();
        let dropped = self.receiver.drain().count();
        log::debug!("stopping reader, {dropped} queued requests dropped");
        self.close(true);
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn n_procs(&self) -> usize {
        self.n_procs
    }

    pub fn arena(&self) -> &dyn SharedArena {
        self.arena.as_ref()
    }
}

impl Debug for Reader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("source", &self.shared.source)
            .field("n_procs", &self.n_procs)
            .field("queued", &self.receiver.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close(true);
    }
}

fn serve(shared: &ReaderShared, worker: usize, rx: flume::Receiver<ReadTask>) {
    let mut datasets: HashMap<Arc<str>, Box<dyn Dataset>> = HashMap::new();
    while let Ok(task) = rx.recv() {
        if shared.stopped.load(Ordering::Acquire) {
            continue;
        }
        let timer = shared.metrics.service.time();
        let outcome = catch_unwind(AssertUnwindSafe(|| read(shared, &mut datasets, &task)))
            .map(|read| {
                read.map_err(|err| {
                    err.with_context(format!(
                        "request {} on {}",
                        task.completion.id(),
                        task.request.path()
                    ))
                })
            })
            .unwrap_or_else(|payload| {
                // The handle may have been left mid-read.
                datasets.remove(task.request.path());
                Err(tessera_err!(
                    WorkerPanic: "reader worker {worker} on request {}: {}",
                    task.completion.id(),
                    panic_message(payload.as_ref())
                ))
            });

        drop(timer);

        match &outcome {
            Ok(nbytes) => {
                shared.metrics.resolved.inc();
                shared.metrics.bytes.add(*nbytes as i64);
                let rows = task.resolved.shape.first().copied().unwrap_or(1);
                shared.metrics.request_rows.update(rows as i64);
            }
            Err(err) => {
                log::warn!("{err}");
                shared.metrics.failed.inc();
            }
        }
        task.completion.complete(outcome.map(|_| ()));
    }
    log::debug!("reader worker {worker} exiting");
}

fn read(
    shared: &ReaderShared,
    datasets: &mut HashMap<Arc<str>, Box<dyn Dataset>>,
    task: &ReadTask,
) -> TesseraResult<usize> {
    let path = task.request.info().path();
    let dataset = match datasets.entry(path.clone()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(shared.source.open(path)?),
    };
    // SAFETY: the worker holds the only reference that writes the stage, and no reader looks at
    // it until the completion leaves the pending state.
    let out = unsafe { task.completion.output() };
    task.resolved
        .execute(dataset.as_mut(), task.request.columns(), out)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tessera_error::ErrorKind;
    use tessera_io::{AnonymousArena, ColumnSelection, FileArena, MemorySource};
    use tessera_metrics::names;

    use super::*;
    use crate::fixtures::{
        Fault, FaultySource, GatedSource, Gates, INDEXED, TABLE, hundred, value, values,
    };
    use crate::{RequestPool, Stage, StagePool};

    fn reader(source: Arc<dyn DatasetSource>, n_procs: usize) -> Reader {
        let options = ReaderOptions {
            n_procs,
            ..Default::default()
        };
        Reader::new(source, Arc::new(AnonymousArena), options).unwrap()
    }

    #[rstest]
    fn four_retrieval_modes(hundred: Arc<MemorySource>) {
        let reader = reader(hundred, 2);
        let dataset = reader.dataset(INDEXED).unwrap();
        let pool = dataset
            .create_stage_pool(&[Some(10)], &ColumnSelection::All, 4)
            .unwrap();

        let copied = reader.request(&dataset.slice(0..10), &pool).unwrap();
        let direct = reader.request(&dataset.slice(10..20), &pool).unwrap();
        let unsafe_access = reader.request(&dataset.slice(20..30), &pool).unwrap();
        let proxied = reader.request(&dataset.slice(30..40), &pool).unwrap();

        assert_eq!(
            values(copied.get().unwrap().bytes()),
            (0..10).collect::<Vec<_>>()
        );
        let sum: u64 = direct
            .get_direct(|view| view.iter().map(value).sum())
            .unwrap();
        assert_eq!(sum, (10..20).sum::<u64>());

        let raw = unsafe_access.get_unsafe().unwrap();
        assert_eq!(values(raw), (20..30).collect::<Vec<_>>());
        unsafe_access.end_access();

        let mut proxy = proxied.get_proxy().unwrap();
        assert_eq!(values(proxy.bytes().unwrap()), (30..40).collect::<Vec<_>>());
        assert_eq!(proxy.view().unwrap().rows(), 10);
        proxy.release();
        proxy.release();
        assert_eq!(proxy.bytes().unwrap_err().kind(), ErrorKind::UseAfterRelease);

        assert_eq!(pool.idle(), 4);
    }

    #[rstest]
    fn copies_survive_stage_reuse(hundred: Arc<MemorySource>) {
        let reader = reader(hundred, 1);
        let dataset = reader.dataset(INDEXED).unwrap();
        let stage = dataset.create_stage_rows(5, &ColumnSelection::All).unwrap();

        let first = reader.request(&dataset.slice(0..5), &stage).unwrap();
        let first = first.get().unwrap();
        let second = reader.request(&dataset.slice(50..55), &stage).unwrap();
        second.wait().unwrap();
        assert_eq!(values(first.bytes()), vec![0, 1, 2, 3, 4]);
    }

    #[rstest]
    fn busy_stage_detected(hundred: Arc<MemorySource>) {
        let reader = reader(hundred, 1);
        let dataset = reader.dataset(INDEXED).unwrap();
        let stage = dataset.create_stage_rows(5, &ColumnSelection::All).unwrap();

        let proxy = reader
            .request(&dataset.slice(0..5), &stage)
            .unwrap()
            .get_proxy()
            .unwrap();
        let err = reader.request(&dataset.slice(5..10), &stage).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        drop(proxy);
        assert!(reader.request(&dataset.slice(5..10), &stage).is_ok());
    }

    #[rstest]
    fn bounds_checked_at_schedule_time(hundred: Arc<MemorySource>) {
        let reader = reader(hundred, 1);
        let dataset = reader.dataset(INDEXED).unwrap();
        let stage = dataset.create_stage_rows(5, &ColumnSelection::All).unwrap();

        let too_big = reader.request(&dataset.slice(0..6), &stage).unwrap_err();
        assert_eq!(too_big.kind(), ErrorKind::OutOfBounds);
        let past_end = reader.request(&dataset.slice(98..101), &stage).unwrap_err();
        assert_eq!(past_end.kind(), ErrorKind::OutOfBounds);
        assert!(!stage.is_leased());
    }

    #[rstest]
    fn selections_and_columns(hundred: Arc<MemorySource>) {
        let reader = reader(hundred, 3);
        let dataset = reader.dataset(TABLE).unwrap();
        let squares = ColumnSelection::field("square");
        let stage = dataset.create_stage_rows(8, &squares).unwrap();

        let strided = dataset.read(0, 20, 5).column("square");
        let rows = reader.request(&strided, &stage).unwrap().get().unwrap();
        assert_eq!(rows.shape(), &[4]);
        assert_eq!(values(rows.bytes()), vec![0, 25, 100, 225]);

        let points = dataset.coordinates([9, 3, 4]).column("square");
        let rows = reader.request(&points, &stage).unwrap().get().unwrap();
        assert_eq!(values(rows.bytes()), vec![81, 9, 16]);

        let wrap = dataset.joined(98..100, 0..2).column("square");
        let rows = reader.request(&wrap, &stage).unwrap().get().unwrap();
        assert_eq!(values(rows.bytes()), vec![9604, 9801, 0, 1]);

        let whole = dataset.row(7);
        let stage = dataset.create_stage_rows(1, &ColumnSelection::All).unwrap();
        let rows = reader.request(&whole, &stage).unwrap().get().unwrap();
        assert_eq!(values(rows.bytes()), vec![7, 49]);
    }

    #[test]
    fn read_errors_reach_every_mode() {
        let source = Arc::new(FaultySource {
            rows: 20,
            poisoned: 3,
            fault: Fault::Fail,
        });
        let reader = reader(source, 2);
        let dataset = reader.dataset(INDEXED).unwrap();
        let pool = dataset
            .create_stage_pool(&[Some(4)], &ColumnSelection::All, 4)
            .unwrap();
        let bad = || reader.request(&dataset.slice(0..4), &pool).unwrap();

        assert_eq!(bad().get().unwrap_err().kind(), ErrorKind::DatasetRead);
        assert_eq!(
            bad().get_direct(|_| ()).unwrap_err().kind(),
            ErrorKind::DatasetRead
        );
        let future = bad();
        let err = future.get_unsafe().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatasetRead);
        let context = format!("request {} on /indexed: ", future.id());
        assert!(err.to_string().starts_with(&context));
        future.end_access();
        assert_eq!(
            bad().get_proxy().unwrap_err().kind(),
            ErrorKind::DatasetRead
        );
        assert!(reader.request(&dataset.slice(4..8), &pool).unwrap().get().is_ok());
    }

    #[test]
    fn worker_panic_fails_only_its_request() {
        let source = Arc::new(FaultySource {
            rows: 20,
            poisoned: 3,
            fault: Fault::Panic,
        });
        let reader = reader(source, 1);
        let dataset = reader.dataset(INDEXED).unwrap();
        let stage = dataset.create_stage_rows(4, &ColumnSelection::All).unwrap();

        let err = reader.request(&dataset.slice(0..4), &stage).unwrap().get();
        assert_eq!(err.unwrap_err().kind(), ErrorKind::WorkerPanic);
        let rows = reader.request(&dataset.slice(4..8), &stage).unwrap().get();
        assert_eq!(values(rows.unwrap().bytes()), vec![4, 5, 6, 7]);
    }

    #[test]
    fn pool_returns_futures_in_submission_order() {
        let Gates {
            source,
            gates,
            finished,
            ..
        } = GatedSource::new(10, &[0, 1]);
        let reader = reader(source, 3);
        let dataset = reader.dataset(INDEXED).unwrap();
        let pool = dataset
            .create_stage_pool(&[Some(1)], &ColumnSelection::All, 3)
            .unwrap();

        let requests = RequestPool::new();
        for row in 0..3 {
            requests
                .add(reader.request(&dataset.row(row), &pool).unwrap())
                .unwrap();
        }
        assert_eq!(finished.recv().unwrap(), 2);

        let mut gates = gates.into_iter();
        let first_gate = gates.next().unwrap();
        drop(gates);
        assert_eq!(finished.recv().unwrap(), 1);
        drop(first_gate);

        let order: Vec<u64> = std::iter::from_fn(|| requests.try_next())
            .map(|future| value(future.get().unwrap().bytes()))
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn close_lets_queued_requests_finish() {
        let Gates { source, gates, .. } = GatedSource::new(10, &[0]);
        let reader = reader(source, 1);
        let dataset = reader.dataset(INDEXED).unwrap();
        let pool = dataset
            .create_stage_pool(&[Some(1)], &ColumnSelection::All, 2)
            .unwrap();
        let blocked = reader.request(&dataset.row(0), &pool).unwrap();
        let queued = reader.request(&dataset.row(1), &pool).unwrap();

        reader.close(false);
        reader.close(false);
        assert_eq!(
            reader.request(&dataset.row(2), &pool).unwrap_err().kind(),
            ErrorKind::Closed
        );
        drop(gates);
        assert_eq!(value(blocked.get().unwrap().bytes()), 0);
        assert_eq!(value(queued.get().unwrap().bytes()), 1);
        reader.close(true);
    }

    #[test]
    fn stop_fails_queued_requests() {
        let Gates {
            source,
            gates,
            entered,
            finished,
        } = GatedSource::new(10, &[0]);
        let reader = reader(source, 1);
        let dataset = reader.dataset(INDEXED).unwrap();
        let pool = dataset
            .create_stage_pool(&[Some(1)], &ColumnSelection::All, 2)
            .unwrap();
        let in_flight = reader.request(&dataset.row(0), &pool).unwrap();
        let queued = reader.request(&dataset.row(1), &pool).unwrap();
        assert_eq!(entered.recv().unwrap(), 0);

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(gates);
        });
        reader.stop();
        stopper.join().unwrap();

        assert_eq!(queued.get().unwrap_err().kind(), ErrorKind::Closed);
        assert_eq!(value(in_flight.get().unwrap().bytes()), 0);
        assert_eq!(finished.try_iter().collect::<Vec<_>>(), vec![0]);
        assert!(reader.is_closed());
    }

    #[rstest]
    fn metrics_count_requests(hundred: Arc<MemorySource>) {
        let metrics = TesseraMetrics::default();
        let reader = Reader::new(
            hundred,
            Arc::new(AnonymousArena),
            ReaderOptions {
                n_procs: 2,
                metrics: metrics.clone(),
                ..Default::default()
            },
        )
        .unwrap();
        let dataset = reader.dataset(INDEXED).unwrap();
        let stage = dataset.create_stage_rows(10, &ColumnSelection::All).unwrap();
        reader.request(&dataset.slice(0..10), &stage).unwrap().wait().unwrap();
        reader.request(&dataset.slice(20..24), &stage).unwrap().wait().unwrap();
        reader.close(true);

        assert_eq!(metrics.counter(names::READER_SUBMITTED).count(), 2);
        assert_eq!(metrics.counter(names::READER_RESOLVED).count(), 2);
        assert_eq!(metrics.counter(names::READER_BYTES).count(), 112);
        assert_eq!(metrics.timer(names::READER_SERVICE).count(), 2);
        let rows = metrics.histogram(names::READER_REQUEST_ROWS);
        assert_eq!(rows.count(), 2);
        assert_eq!(rows.snapshot().max(), 10);
        assert_eq!(rows.snapshot().min(), 4);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    fn notify_sees_every_resolution(#[case] n_procs: usize) {
        let source = Arc::new(FaultySource {
            rows: 20,
            poisoned: 9,
            fault: Fault::Fail,
        });
        let (tx, rx) = flume::unbounded();
        let notify: NotifyFn = Arc::new(move |id, outcome: Result<(), &TesseraError>| {
            tx.send((id, outcome.map_err(TesseraError::kind))).unwrap();
        });
        let reader = Reader::new(
            source,
            Arc::new(AnonymousArena),
            ReaderOptions {
                n_procs,
                notify: Some(notify),
                ..Default::default()
            },
        )
        .unwrap();
        let dataset = reader.dataset(INDEXED).unwrap();
        let pool = dataset
            .create_stage_pool(&[Some(4)], &ColumnSelection::All, 3)
            .unwrap();
        let futures: Vec<_> = [0..4, 8..12, 12..16]
            .into_iter()
            .map(|rows| reader.request(&dataset.slice(rows), &pool).unwrap())
            .collect();
        let ids: Vec<u64> = futures.iter().map(RequestFuture::id).collect();
        drop(futures);

        let mut seen: Vec<_> = rx.iter().take(3).collect();
        seen.sort_by_key(|(id, _)| *id);
        assert_eq!(
            seen,
            vec![
                (ids[0], Ok(())),
                (ids[1], Err(ErrorKind::DatasetRead)),
                (ids[2], Ok(())),
            ]
        );
    }

    #[rstest]
    fn panicking_notify_leaves_request_served(hundred: Arc<MemorySource>) {
        let reader = Reader::new(
            hundred,
            Arc::new(AnonymousArena),
            ReaderOptions {
                n_procs: 1,
                notify: Some(Arc::new(|id: u64, _: Result<(), &TesseraError>| {
                    if id < u64::MAX {
                        panic!("hook failed on {id}")
                    }
                })),
                ..Default::default()
            },
        )
        .unwrap();
        let dataset = reader.dataset(INDEXED).unwrap();
        let stage = dataset.create_stage_rows(2, &ColumnSelection::All).unwrap();
        for start in [0, 2] {
            let rows = reader.request(&dataset.slice(start..start + 2), &stage).unwrap();
            assert_eq!(values(rows.get().unwrap().bytes()), vec![start, start + 1]);
        }
    }

    #[test]
    fn notify_reports_stopped_requests() {
        let Gates {
            source,
            gates,
            entered,
            ..
        } = GatedSource::new(10, &[0]);
        let (tx, rx) = flume::unbounded();
        let reader = Reader::new(
            source,
            Arc::new(AnonymousArena),
            ReaderOptions {
                n_procs: 1,
                notify: Some(Arc::new(move |id, outcome: Result<(), &TesseraError>| {
                    tx.send((id, outcome.map_err(TesseraError::kind))).unwrap();
                })),
                ..Default::default()
            },
        )
        .unwrap();
        let dataset = reader.dataset(INDEXED).unwrap();
        let pool = dataset
            .create_stage_pool(&[Some(1)], &ColumnSelection::All, 2)
            .unwrap();
        let in_flight = reader.request(&dataset.row(0), &pool).unwrap();
        let queued = reader.request(&dataset.row(1), &pool).unwrap();
        assert_eq!(entered.recv().unwrap(), 0);

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(gates);
        });
        reader.stop();
        stopper.join().unwrap();

        let mut seen: Vec<_> = rx.try_iter().collect();
        seen.sort_by_key(|(id, _)| *id);
        assert_eq!(
            seen,
            vec![
                (in_flight.id(), Ok(())),
                (queued.id(), Err(ErrorKind::Closed)),
            ]
        );
    }

    #[test]
    fn file_backed_stage_readable_through_its_handle() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(crate::fixtures::source(10), 1);
        let stage = Stage::new(&FileArena::new(dir.path()), &[4], 8).unwrap();
        let dataset = reader.dataset(INDEXED).unwrap();
        let proxy = reader
            .request(&dataset.slice(3..7), &stage)
            .unwrap()
            .get_proxy()
            .unwrap();

        let path = stage.handle().path().unwrap();
        assert!(path.starts_with(dir.path()));
        let mapped = std::fs::read(path).unwrap();
        assert_eq!(values(&mapped[..32]), vec![3, 4, 5, 6]);
        assert_eq!(proxy.bytes().unwrap(), &mapped[..32]);
    }

    #[test]
    fn standalone_stage_from_arena() {
        let source = crate::fixtures::source(10);
        let reader = reader(source, 1);
        let stage = Stage::new(reader.arena(), &[3], 8).unwrap();
        let dataset = reader.dataset(INDEXED).unwrap();
        let rows = reader.request(&dataset.slice(7..10), &stage).unwrap().get();
        assert_eq!(values(rows.unwrap().bytes()), vec![7, 8, 9]);
        let _pool: StagePool = dataset
            .create_stage_pool(&[], &ColumnSelection::All, 1)
            .unwrap();
    }
}
