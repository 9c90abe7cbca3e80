use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tessera_error::{TesseraError, TesseraResult, tessera_bail};

use crate::stage::StageLease;
use crate::worker::panic_message;
use crate::{NotifyFn, OwnedRows, RowsView, Stage};

enum State {
    Pending,
    Ready,
    Failed(Arc<TesseraError>),
}

struct Status {
    state: State,
    // Set when the future is dropped before the request is served.
    abandoned: bool,
}

/// The shared state of one scheduled request.
///
/// The stage stays leased until the result is no longer accessed, or, if the future is dropped
/// first, until the worker is done writing it.
pub(crate) struct Completion {
    id: u64,
    shape: Vec<u64>,
    row_nbytes: usize,
    nbytes: usize,
    stage: Stage,
    lease: Mutex<Option<StageLease>>,
    status: Mutex<Status>,
    resolved: Condvar,
    notify: Option<NotifyFn>,
}

impl Completion {
    pub fn new(
        id: u64,
        shape: Vec<u64>,
        row_nbytes: usize,
        nbytes: usize,
        lease: StageLease,
        notify: Option<NotifyFn>,
    ) -> Self {
        Self {
            id,
            shape,
            row_nbytes,
            nbytes,
            stage: lease.stage().clone(),
            lease: Mutex::new(Some(lease)),
            status: Mutex::new(Status {
                state: State::Pending,
                abandoned: false,
            }),
            resolved: Condvar::new(),
            notify,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Moves a pending completion to ready or failed, then runs the notify hook. Later calls
    /// are ignored.
    pub fn complete(&self, outcome: TesseraResult<()>) {
        let mut status = self.status.lock();
        if !matches!(status.state, State::Pending) {
            return;
        }
        let failure = outcome.err().map(Arc::new);
        status.state = match &failure {
            None => State::Ready,
            Some(err) => State::Failed(err.clone()),
        };
        let abandoned = status.abandoned;
        drop(status);
        self.resolved.notify_all();

        if let Some(notify) = &self.notify {
            let outcome = failure.as_deref().map_or(Ok(()), Err);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| notify(self.id, outcome))) {
                log::warn!(
                    "notify hook for request {} panicked: {}",
                    self.id,
                    panic_message(payload.as_ref())
                );
            }
        }
        if abandoned {
            self.release();
        }
    }

    fn wait(&self) -> TesseraResult<()> {
        let mut status = self.status.lock();
        loop {
            match &status.state {
                State::Pending => self.resolved.wait(&mut status),
                State::Ready => return Ok(()),
                State::Failed(err) => return Err(TesseraError::Shared(err.clone())),
            }
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self.status.lock().state, State::Pending)
    }

    /// Frees the stage now if the worker is done with it, otherwise once it is.
    fn abandon(&self) {
        let mut status = self.status.lock();
        if matches!(status.state, State::Pending) {
            status.abandoned = true;
        } else {
            drop(status);
            self.release();
        }
    }

    fn release(&self) {
        self.lease.lock().take();
    }

    fn is_released(&self) -> bool {
        self.lease.lock().is_none()
    }

    /// The result region, for the worker serving the request.
    ///
    /// # Safety
    ///
    /// Only the worker may call this, and only while the completion is pending.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn output(&self) -> &mut [u8] {
        // SAFETY: the stage is leased to this request and readers wait for the completion to
        // leave the pending state first.
        unsafe { &mut self.stage.as_mut_slice()[..self.nbytes] }
    }

    /// # Safety
    ///
    /// The completion must be ready and the stage not yet released.
    unsafe fn result(&self) -> &[u8] {
        // SAFETY: once ready, the worker no longer writes the stage.
        unsafe { &self.stage.as_slice()[..self.nbytes] }
    }
}

/// A handle to one scheduled request.
///
/// Every retrieval mode blocks until the worker has written the result, and fails with the
/// worker's error if the read failed. The stage the result lives in stays reserved for as long
/// as the result is accessible:
///
/// * [`get`][Self::get] copies the result out and frees the stage before returning.
/// * [`get_direct`][Self::get_direct] lends the result to a callback and frees the stage after
///   it returns.
/// * [`get_proxy`][Self::get_proxy] returns a [`StageProxy`] that frees the stage when released
///   and refuses access afterwards.
/// * [`get_unsafe`][Self::get_unsafe] returns a bare slice borrowed from the future, valid until
///   [`end_access`][Self::end_access] consumes it.
///
/// Dropping a future frees its stage once the worker is done with it.
pub struct RequestFuture {
    completion: Arc<Completion>,
    // Set once a proxy has taken over the lease.
    handed_off: bool,
}

impl RequestFuture {
    pub(crate) fn new(completion: Arc<Completion>) -> Self {
        Self {
            completion,
            handed_off: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.completion.id
    }

    pub fn shape(&self) -> &[u64] {
        &self.completion.shape
    }

    pub fn nbytes(&self) -> usize {
        self.completion.nbytes
    }

    /// Whether the request has been served, successfully or not. Never blocks.
    pub fn is_ready(&self) -> bool {
        !self.completion.is_pending()
    }

    /// Blocks until the request has been served.
    pub fn wait(&self) -> TesseraResult<()> {
        self.completion.wait()
    }

    /// Copies the result into owned memory.
    pub fn get(self) -> TesseraResult<OwnedRows> {
        self.completion.wait()?;
        // SAFETY: the completion is ready.
        let data = Bytes::copy_from_slice(unsafe { self.completion.result() });
        Ok(OwnedRows::new(
            data,
            self.completion.row_nbytes,
            self.completion.shape.clone(),
        ))
    }

    /// Calls `f` with a view of the result in place.
    pub fn get_direct<R>(self, f: impl FnOnce(RowsView<'_>) -> R) -> TesseraResult<R> {
        self.completion.wait()?;
        // SAFETY: the completion is ready and `self` keeps the stage leased until `f` returns.
        let data = unsafe { self.completion.result() };
        Ok(f(RowsView::new(data, self.completion.row_nbytes)))
    }

    /// Returns the result in place, with no handle tracking how long it is used.
    ///
    /// The slice borrows the future, so it cannot outlive [`end_access`][Self::end_access] or a
    /// drop of the future, either of which frees the stage for the next request:
    ///
    /// ```compile_fail
    /// fn sum_after_release(future: tessera::RequestFuture) -> usize {
    ///     let data = future.get_unsafe().unwrap();
    ///     future.end_access();
    ///     data.len()
    /// }
    /// ```
    pub fn get_unsafe(&self) -> TesseraResult<&[u8]> {
        self.completion.wait()?;
        // SAFETY: the completion is ready and `self` keeps the stage leased for as long as the
        // slice borrows it.
        Ok(unsafe { self.completion.result() })
    }

    /// Ends access obtained through [`get_unsafe`][Self::get_unsafe], freeing the stage.
    pub fn end_access(self) {}

    /// Returns a tracked handle to the result in place.
    pub fn get_proxy(mut self) -> TesseraResult<StageProxy> {
        self.completion.wait()?;
        self.handed_off = true;
        Ok(StageProxy {
            generation: self.completion.stage.generation(),
            completion: Some(self.completion.clone()),
        })
    }
}

impl Drop for RequestFuture {
    fn drop(&mut self) {
        if !self.handed_off {
            self.completion.abandon();
        }
    }
}

impl Debug for RequestFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFuture")
            .field("id", &self.id())
            .field("shape", &self.shape())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Tracked access to a served request's result.
///
/// Access through the proxy fails with `UseAfterRelease` once it has been released, and the
/// stage cannot be handed to another request until then.
pub struct StageProxy {
    completion: Option<Arc<Completion>>,
    generation: u64,
}

impl StageProxy {
    pub fn bytes(&self) -> TesseraResult<&[u8]> {
        let Some(completion) = self.completion.as_ref().filter(|c| !c.is_released()) else {
            tessera_bail!(UseAfterRelease: "stage proxy was already released");
        };
        let generation = completion.stage.generation();
        if generation != self.generation {
            tessera_bail!(
                UseAfterRelease: "stage was reassigned: generation {generation}, expected {}",
                self.generation
            );
        }
        // SAFETY: the completion is ready and this proxy holds the lease.
        Ok(unsafe { completion.result() })
    }

    pub fn view(&self) -> TesseraResult<RowsView<'_>> {
        let data = self.bytes()?;
        let row_nbytes = self.completion.as_ref().map_or(0, |c| c.row_nbytes);
        Ok(RowsView::new(data, row_nbytes))
    }

    pub fn shape(&self) -> Option<&[u64]> {
        self.completion.as_ref().map(|c| c.shape.as_slice())
    }

    /// Ends access and frees the stage. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.completion.is_none()
    }
}

impl Debug for StageProxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageProxy")
            .field("id", &self.completion.as_ref().map(|c| c.id))
            .field("generation", &self.generation)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for StageProxy {
    fn drop(&mut self) {
        self.release();
    }
}
