//! Deadline and cancellation for top-level operations.

use std::{
    io::{self, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::error::{Error, Result};

/// Deadline and cancellation flag shared by every request issued
/// for a single operation.
#[derive(Clone, Debug, Default)]
pub struct OperationScope {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

/// Handle to cancel an [`OperationScope`] from another thread.
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl OperationScope {
    /// Scope with no deadline.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        OperationScope {
            deadline: Instant::now().checked_add(timeout),
            cancelled: Default::default(),
        }
    }

    /// Scope sharing the cancellation flag of this one, with a deadline
    /// no later than `timeout` from now.
    pub fn narrowed(&self, timeout: Duration) -> Self {
        let deadline = Instant::now().checked_add(timeout);
        OperationScope {
            deadline: match (self.deadline, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancelled))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Return an error if the operation was cancelled, or if the
    /// deadline has expired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Deadline),
            _ => Ok(()),
        }
    }

    /// Timeout for the next request: the remaining time until the
    /// deadline, but never more than `limit`.
    pub fn request_timeout(&self, limit: Duration) -> Result<Duration> {
        self.check()?;

        Ok(match self.deadline {
            Some(deadline) => limit.min(deadline.saturating_duration_since(Instant::now())),
            None => limit,
        })
    }

    /// Wrap `reader` so every `read` checks this scope first.
    pub(crate) fn guard<R: Read>(&self, reader: R) -> ScopedReader<R> {
        ScopedReader {
            scope: self.clone(),
            reader,
        }
    }
}

pub(crate) struct ScopedReader<R> {
    scope: OperationScope,
    reader: R,
}

impl<R: Read> Read for ScopedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.scope.check().map_err(Error::into_io)?;
        self.reader.read(buf)
    }
}

#[test]
fn expired_deadline() {
    let scope = OperationScope::with_timeout(Duration::ZERO);
    assert!(matches!(scope.check(), Err(Error::Deadline)));

    let scope = OperationScope::with_timeout(Duration::from_secs(60));
    assert!(scope.check().is_ok());

    let timeout = scope.request_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(timeout, Duration::from_secs(5));
}

#[test]
fn cancel_from_handle() {
    let scope = OperationScope::unbounded();
    let clone = scope.clone();

    scope.cancel_handle().cancel();

    assert!(matches!(clone.check(), Err(Error::Cancelled)));

    let parent = OperationScope::unbounded();
    let child = parent.narrowed(Duration::from_secs(60));
    parent.cancel_handle().cancel();
    assert!(matches!(child.check(), Err(Error::Cancelled)));

    let mut reader = clone.guard(&b"data"[..]);
    let err = reader.read(&mut [0; 4]).unwrap_err();
    assert!(matches!(Error::from_io(err), Error::Cancelled));
}
