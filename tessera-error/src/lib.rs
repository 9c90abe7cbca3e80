#![deny(missing_docs)]
//! Errors shared by every Tessera crate.
//!
//! The taxonomy follows the lifecycle of a read: failures raised by the dataset back end
//! ([`TesseraError::DatasetRead`]), requests or stages whose extents do not line up
//! ([`TesseraError::OutOfBounds`]), work attempted against a queue or reader that has already
//! shut down ([`TesseraError::Closed`]), and access to a staged result after it has been handed
//! back ([`TesseraError::UseAfterRelease`]). Worker paths attach the block or request they
//! were serving with [`TesseraError::with_context`]; [`TesseraError::kind`] still reports the
//! underlying failure.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;

/// A string that is either static or owned, used as the message of every error variant.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    fn from(msg: T) -> Self {
        Self(msg.into())
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The top-level error type for Tessera.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum TesseraError {
    /// The dataset back end failed to produce the requested rows.
    #[error("dataset read failed: {0}\nBacktrace:\n{1}")]
    DatasetRead(ErrString, Backtrace),
    /// A request, stage or block does not fit the extent it was matched against.
    #[error("out of bounds: {0}\nBacktrace:\n{1}")]
    OutOfBounds(ErrString, Backtrace),
    /// The queue or reader has been closed.
    #[error("closed: {0}\nBacktrace:\n{1}")]
    Closed(ErrString, Backtrace),
    /// A staged result was accessed after its stage was released.
    #[error("use after release: {0}\nBacktrace:\n{1}")]
    UseAfterRelease(ErrString, Backtrace),
    /// An argument was rejected before any work was scheduled.
    #[error("invalid argument: {0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, Backtrace),
    /// A worker panicked while holding a slot or servicing a request.
    #[error("worker panicked: {0}\nBacktrace:\n{1}")]
    WorkerPanic(ErrString, Backtrace),
    /// A bounded wait gave up.
    #[error("timed out: {0}\nBacktrace:\n{1}")]
    Timeout(ErrString, Backtrace),
    /// An operating system I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An error observed by more than one party.
    #[error("{0}")]
    Shared(Arc<TesseraError>),
    /// An error with an additional message.
    #[error("{0}: {1}")]
    Context(ErrString, #[source] Box<TesseraError>),
}

/// A flattened classification of a [`TesseraError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`TesseraError::DatasetRead`].
    DatasetRead,
    /// See [`TesseraError::OutOfBounds`].
    OutOfBounds,
    /// See [`TesseraError::Closed`].
    Closed,
    /// See [`TesseraError::UseAfterRelease`].
    UseAfterRelease,
    /// See [`TesseraError::InvalidArgument`].
    InvalidArgument,
    /// See [`TesseraError::WorkerPanic`].
    WorkerPanic,
    /// See [`TesseraError::Timeout`].
    Timeout,
    /// See [`TesseraError::Io`].
    Io,
}

impl TesseraError {
    /// Returns the kind of this error, looking through [`TesseraError::Shared`] and
    /// [`TesseraError::Context`] wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::DatasetRead(..) => ErrorKind::DatasetRead,
            TesseraError::OutOfBounds(..) => ErrorKind::OutOfBounds,
            TesseraError::Closed(..) => ErrorKind::Closed,
            TesseraError::UseAfterRelease(..) => ErrorKind::UseAfterRelease,
            TesseraError::InvalidArgument(..) => ErrorKind::InvalidArgument,
            TesseraError::WorkerPanic(..) => ErrorKind::WorkerPanic,
            TesseraError::Timeout(..) => ErrorKind::Timeout,
            TesseraError::Io(..) => ErrorKind::Io,
            TesseraError::Shared(inner) => inner.kind(),
            TesseraError::Context(_, inner) => inner.kind(),
        }
    }

    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        TesseraError::Context(msg.into(), Box::new(self))
    }
}

impl Debug for TesseraError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// A type alias for Results that return [`TesseraError`]s as their error type.
pub type TesseraResult<T> = Result<T, TesseraError>;

/// Construct a [`TesseraError`], optionally naming the variant.
///
/// ```
/// use tessera_error::{ErrorKind, tessera_err};
///
/// let err = tessera_err!(OutOfBounds: "row {} is past the end of {} rows", 12, 10);
/// assert_eq!(err.kind(), ErrorKind::OutOfBounds);
/// assert_eq!(tessera_err!("bad").kind(), ErrorKind::InvalidArgument);
/// ```
#[macro_export]
macro_rules! tessera_err {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::TesseraError::$variant(format!($fmt $(, $arg)*).into(), Backtrace::capture())
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::tessera_err!(InvalidArgument: $fmt $(, $arg)*)
    };
}

/// Return early with a [`TesseraError`] built by [`tessera_err!`].
#[macro_export]
macro_rules! tessera_bail {
    ($($tt:tt)+) => {
        return Err($crate::tessera_err!($($tt)+).into())
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;

    #[test]
    fn kind_looks_through_wrappers() {
        let err = tessera_err!(Closed: "reader {} is closed", 3);
        let shared = TesseraError::Shared(Arc::new(err.with_context("while scheduling")));
        assert_eq!(shared.kind(), ErrorKind::Closed);
    }

    #[test]
    fn bail_returns_early() {
        fn check(n: u64) -> TesseraResult<u64> {
            if n == 0 {
                tessera_bail!(OutOfBounds: "n must be positive");
            }
            Ok(n)
        }

        assert_eq!(check(2).unwrap(), 2);
        assert_eq!(check(0).unwrap_err().kind(), ErrorKind::OutOfBounds);
    }

    #[rstest]
    #[case(tessera_err!(DatasetRead: "short read"), ErrorKind::DatasetRead)]
    #[case(tessera_err!(WorkerPanic: "boom"), ErrorKind::WorkerPanic)]
    #[case(tessera_err!(Timeout: "no free stage"), ErrorKind::Timeout)]
    fn context_prefixes_message_and_keeps_kind(
        #[case] err: TesseraError,
        #[case] kind: ErrorKind,
    ) {
        let err = err.with_context("block 3 of /points");
        assert_eq!(err.kind(), kind);
        assert!(err.to_string().starts_with("block 3 of /points: "));
    }
}
