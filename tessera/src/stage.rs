use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tessera_error::{TesseraResult, tessera_bail, tessera_err};
use tessera_io::{SharedArena, SharedRegion, ShmHandle};

/// Something requests can be staged into: a single [`Stage`] or a rotating [`StagePool`].
pub trait StageTarget {
    /// Leases a stage for a result of `nbytes` bytes, blocking while the target has no free
    /// stage.
    ///
    /// Fails with `OutOfBounds` when the result cannot fit, with `InvalidArgument` when a lone
    /// stage is still leased to an earlier request, and with `Timeout` when a pool with a lease
    /// timeout frees no stage in time.
    fn lease(&self, nbytes: usize) -> TesseraResult<StageLease>;
}

struct StageInner {
    region: SharedRegion,
    shape: Vec<u64>,
    itemsize: usize,
    leased: AtomicBool,
    generation: AtomicU64,
}

/// A shared-memory region with a declared shape that request results are written into.
///
/// A stage serves one request at a time. It is leased when the request is scheduled and
/// handed back once its result is no longer accessed.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    /// Allocates a stage holding `shape` items of `itemsize` bytes.
    pub fn new(arena: &dyn SharedArena, shape: &[u64], itemsize: usize) -> TesseraResult<Self> {
        let nbytes = shape
            .iter()
            .try_fold(itemsize as u64, |acc, dim| acc.checked_mul(*dim))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| tessera_err!(OutOfBounds: "stage of shape {shape:?} is too large"))?;
        if nbytes == 0 {
            tessera_bail!("stage of shape {shape:?} holds no bytes");
        }
        let region = arena.allocate(nbytes)?;
        Ok(Self {
            inner: Arc::new(StageInner {
                region,
                shape: shape.to_vec(),
                itemsize,
                leased: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn shape(&self) -> &[u64] {
        &self.inner.shape
    }

    pub fn itemsize(&self) -> usize {
        self.inner.itemsize
    }

    pub fn nbytes(&self) -> usize {
        self.inner.region.len()
    }

    /// The handle another process can map this stage by, if the arena is file backed.
    pub fn handle(&self) -> &ShmHandle {
        self.inner.region.handle()
    }

    /// Counts the leases that have ended on this stage.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn is_leased(&self) -> bool {
        self.inner.leased.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// The caller must hold the lease, and no other view of the stage may be live for the
    /// lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: exclusivity is the caller's contract.
        unsafe { self.inner.region.as_mut_slice() }
    }

    /// # Safety
    ///
    /// No mutable view of the stage may be live for the lifetime of the returned slice.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: as above.
        unsafe { self.inner.region.as_slice() }
    }

    fn check_fits(&self, nbytes: usize) -> TesseraResult<()> {
        if nbytes > self.nbytes() {
            tessera_bail!(
                OutOfBounds: "result of {nbytes} bytes does not fit a stage of {} bytes",
                self.nbytes()
            );
        }
        Ok(())
    }

    fn try_lease(&self, home: Option<Arc<PoolShared>>) -> Option<StageLease> {
        self.inner
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StageLease {
                stage: self.clone(),
                home,
            })
    }
}

impl StageTarget for Stage {
    fn lease(&self, nbytes: usize) -> TesseraResult<StageLease> {
        self.check_fits(nbytes)?;
        self.try_lease(None).ok_or_else(|| {
            tessera_err!("stage is still leased to an unreleased request, release it first")
        })
    }
}

impl Debug for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("shape", &self.inner.shape)
            .field("itemsize", &self.inner.itemsize)
            .field("leased", &self.is_leased())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Exclusive use of a [`Stage`] for one request. Dropping the lease frees the stage.
pub struct StageLease {
    stage: Stage,
    home: Option<Arc<PoolShared>>,
}

impl StageLease {
    pub(crate) fn stage(&self) -> &Stage {
        &self.stage
    }
}

impl Debug for StageLease {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLease")
            .field("stage", &self.stage)
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Drop for StageLease {
    fn drop(&mut self) {
        let inner = &self.stage.inner;
        inner.generation.fetch_add(1, Ordering::AcqRel);
        inner.leased.store(false, Ordering::Release);
        if let Some(home) = self.home.take() {
            home.idle.lock().push_back(self.stage.clone());
            home.available.notify_one();
        }
    }
}

struct PoolShared {
    idle: Mutex<VecDeque<Stage>>,
    available: Condvar,
    stages: usize,
    stage_nbytes: usize,
    shape: Vec<u64>,
}

/// A ring of equally shaped stages handed to requests round robin.
///
/// Leasing blocks while every stage belongs to a request whose result is still accessed, for at
/// most the [lease timeout][Self::with_lease_timeout] if one is set.
#[derive(Clone)]
pub struct StagePool {
    shared: Arc<PoolShared>,
    lease_timeout: Option<Duration>,
}

impl StagePool {
    pub fn new(
        arena: &dyn SharedArena,
        shape: &[u64],
        itemsize: usize,
        count: usize,
    ) -> TesseraResult<Self> {
        if count == 0 {
            tessera_bail!("a stage pool needs at least one stage");
        }
        let stages = (0..count)
            .map(|_| Stage::new(arena, shape, itemsize))
            .collect::<TesseraResult<VecDeque<_>>>()?;
        let stage_nbytes = stages.front().map(Stage::nbytes).unwrap_or_default();
        Ok(Self {
            shared: Arc::new(PoolShared {
                idle: Mutex::new(stages),
                available: Condvar::new(),
                stages: count,
                stage_nbytes,
                shape: shape.to_vec(),
            }),
            lease_timeout: None,
        })
    }

    /// Fails a lease with `Timeout` instead of blocking longer than `timeout` for a free stage.
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    pub fn lease_timeout(&self) -> Option<Duration> {
        self.lease_timeout
    }

    pub fn len(&self) -> usize {
        self.shared.stages
    }

    pub fn is_empty(&self) -> bool {
        self.shared.stages == 0
    }

    pub fn shape(&self) -> &[u64] {
        &self.shared.shape
    }

    pub fn stage_nbytes(&self) -> usize {
        self.shared.stage_nbytes
    }

    /// The number of stages not currently leased.
    pub fn idle(&self) -> usize {
        self.shared.idle.lock().len()
    }
}

impl StageTarget for StagePool {
    fn lease(&self, nbytes: usize) -> TesseraResult<StageLease> {
        if nbytes > self.shared.stage_nbytes {
            tessera_bail!(
                OutOfBounds: "result of {nbytes} bytes does not fit pooled stages of {} bytes",
                self.shared.stage_nbytes
            );
        }
        let deadline = self.lease_timeout.map(|timeout| Instant::now() + timeout);
        let mut idle = self.shared.idle.lock();
        loop {
            while let Some(stage) = idle.pop_front() {
                if let Some(lease) = stage.try_lease(Some(self.shared.clone())) {
                    return Ok(lease);
                }
            }
            match deadline {
                None => self.shared.available.wait(&mut idle),
                Some(deadline) => {
                    let waited = self.shared.available.wait_until(&mut idle, deadline);
                    if waited.timed_out() && idle.is_empty() {
                        tessera_bail!(
                            Timeout: "none of {} stages was freed within {:?}",
                            self.shared.stages,
                            self.lease_timeout.unwrap_or_default()
                        );
                    }
                }
            }
        }
    }
}

impl Debug for StagePool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagePool")
            .field("stages", &self.shared.stages)
            .field("idle", &self.idle())
            .field("shape", &self.shared.shape)
            .field("lease_timeout", &self.lease_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tessera_error::ErrorKind;
    use tessera_io::AnonymousArena;

    use super::*;

    #[test]
    fn stage_sizes() {
        let stage = Stage::new(&AnonymousArena, &[10, 3], 4).unwrap();
        assert_eq!(stage.nbytes(), 120);
        assert!(stage.lease(120).is_ok());
        assert_eq!(stage.lease(121).unwrap_err().kind(), ErrorKind::OutOfBounds);
        assert!(Stage::new(&AnonymousArena, &[0], 4).is_err());
        assert_eq!(
            Stage::new(&AnonymousArena, &[u64::MAX, 2], 8)
                .unwrap_err()
                .kind(),
            ErrorKind::OutOfBounds
        );
    }

    #[test]
    fn busy_stage_rejected_until_released() {
        let stage = Stage::new(&AnonymousArena, &[4], 8).unwrap();
        let lease = stage.lease(32).unwrap();
        assert!(stage.is_leased());
        assert_eq!(stage.lease(8).unwrap_err().kind(), ErrorKind::InvalidArgument);

        drop(lease);
        assert_eq!(stage.generation(), 1);
        assert!(stage.lease(8).is_ok());
    }

    #[test]
    fn pool_rotates_and_blocks() {
        let pool = StagePool::new(&AnonymousArena, &[4], 8, 2).unwrap();
        let first = pool.lease(32).unwrap();
        let second = pool.lease(32).unwrap();
        assert_eq!(pool.idle(), 0);

        let (tx, rx) = flume::bounded(1);
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let lease = pool.lease(8).unwrap();
                tx.send(lease.stage().generation()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        drop(first);
        assert_eq!(rx.recv().unwrap(), 1);
        waiter.join().unwrap();
        drop(second);
        assert_eq!(pool.idle(), 2);
    }

    #[rstest]
    #[case(Duration::ZERO)]
    #[case(Duration::from_millis(20))]
    fn lease_timeout_expires(#[case] timeout: Duration) {
        let pool = StagePool::new(&AnonymousArena, &[4], 8, 1)
            .unwrap()
            .with_lease_timeout(timeout);
        let held = pool.lease(32).unwrap();

        let started = Instant::now();
        assert_eq!(pool.lease(8).unwrap_err().kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= timeout);

        drop(held);
        assert!(pool.lease(8).is_ok());
    }

    #[test]
    fn lease_timeout_met_by_release() {
        let pool = StagePool::new(&AnonymousArena, &[4], 8, 1)
            .unwrap()
            .with_lease_timeout(Duration::from_secs(5));
        let held = pool.lease(32).unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
        });
        assert_eq!(pool.lease(8).unwrap().stage().generation(), 1);
        releaser.join().unwrap();
    }
}
