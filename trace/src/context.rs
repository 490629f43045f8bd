//! Tracking of the current segment for a logical execution flow.
//!
//! Each flow has a slot holding a [`ContextCarrier`], an immutable linked
//! chain of segments. Inside a future wrapped with [`scope`] or [`propagate`]
//! the slot is task-local, so it follows the task across worker threads and
//! `await` points. Plain threads outside any tokio runtime get a slot of their
//! own.
//!
//! Code running on a tokio runtime without a task-local slot has no slot at
//! all: the thread is shared by many tasks, so nothing can be made current
//! there. Reads see an empty chain and pushes are refused. Wrap the future
//! with [`scope`] or [`propagate`], or synchronous code with [`sync_scope`].
//!
//! Starting a segment through the [`Tracer`](crate::tracer::Tracer) pushes it
//! onto the chain. Ending it pops every ended segment off the top, which makes
//! the enclosing segment current again.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::trace::{Segment, Span, Transaction};

tokio::task_local! {
    static CURRENT: RefCell<ContextCarrier>;
}

thread_local! {
    static THREAD_CURRENT: RefCell<ContextCarrier> = RefCell::new(ContextCarrier::background());
}

struct Frame {
    segment: Segment,
    parent: ContextCarrier,
}

/// ContextCarrier is a snapshot of the segment chain of one execution flow.
///
/// Cloning is cheap and the snapshot never changes, so a carrier can be handed
/// to another task or thread to continue the same trace there.
#[derive(Clone, Default)]
pub struct ContextCarrier(Option<Arc<Frame>>);

impl ContextCarrier {
    /// background returns the empty carrier, with no current segment.
    pub fn background() -> Self {
        ContextCarrier(None)
    }

    /// with_segment returns a new carrier with `segment` on top of this one.
    pub fn with_segment(&self, segment: impl Into<Segment>) -> Self {
        ContextCarrier(Some(Arc::new(Frame {
            segment: segment.into(),
            parent: self.clone(),
        })))
    }

    /// segment returns the innermost segment that has not ended.
    pub fn segment(&self) -> Option<Segment> {
        self.live().0.map(|frame| frame.segment.clone())
    }

    /// transaction returns the transaction of the innermost live segment.
    /// Orphaned spans have none.
    pub fn transaction(&self) -> Option<Transaction> {
        self.segment()
            .and_then(|segment| segment.transaction())
            .filter(|tx| !tx.is_ended())
    }

    /// span returns the innermost live segment if it is a span.
    pub fn span(&self) -> Option<Span> {
        match self.segment() {
            Some(Segment::Span(span)) => Some(span),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live().0.is_none()
    }

    fn live(&self) -> ContextCarrier {
        let mut carrier = self;
        while let Some(frame) = &carrier.0 {
            if !frame.segment.is_ended() {
                break;
            }
            carrier = &frame.parent;
        }
        carrier.clone()
    }
}

impl fmt::Debug for ContextCarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chain = f.debug_list();
        let mut carrier = self;
        while let Some(frame) = &carrier.0 {
            chain.entry(&frame.segment.id());
            carrier = &frame.parent;
        }
        chain.finish()
    }
}

fn with_slot<R>(f: impl FnOnce(&RefCell<ContextCarrier>) -> R) -> Option<R> {
    if CURRENT.try_with(|_| ()).is_ok() {
        Some(CURRENT.with(f))
    } else if Handle::try_current().is_ok() {
        None
    } else {
        Some(THREAD_CURRENT.with(f))
    }
}

/// has_slot reports whether the calling flow can hold a current segment.
pub fn has_slot() -> bool {
    with_slot(|_| ()).is_some()
}

/// current returns the carrier of the calling execution flow.
pub fn current() -> ContextCarrier {
    with_slot(|slot| slot.borrow().clone()).unwrap_or_default()
}

/// replace installs `carrier` for the calling execution flow and returns the
/// one it replaces. Returns None, leaving nothing installed, when the flow
/// has no slot.
pub fn replace(carrier: ContextCarrier) -> Option<ContextCarrier> {
    with_slot(|slot| slot.replace(carrier))
}

pub fn current_segment() -> Option<Segment> {
    current().segment()
}

pub fn current_transaction() -> Option<Transaction> {
    current().transaction()
}

pub fn current_span() -> Option<Span> {
    current().span()
}

/// push makes `segment` current. Returns false when the flow has no slot.
pub(crate) fn push(segment: Segment) -> bool {
    with_slot(|slot| {
        let next = slot.borrow().with_segment(segment);
        slot.replace(next);
    })
    .is_some()
}

/// release drops ended segments from the top of the calling flow's chain.
pub(crate) fn release() {
    let _ = with_slot(|slot| {
        let live = slot.borrow().live();
        slot.replace(live);
    });
}

/// ContextGuard restores the previous carrier when dropped. It is bound to
/// the thread that created it.
#[must_use = "the segment is only current while the guard is alive"]
pub struct ContextGuard {
    previous: Option<ContextCarrier>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = replace(previous);
        }
    }
}

/// enter makes `segment` current until the returned guard is dropped.
///
/// On a tokio runtime outside [`scope`] there is no slot to enter and the
/// guard does nothing; use [`sync_scope`] there instead.
pub fn enter(segment: impl Into<Segment>) -> ContextGuard {
    let segment = segment.into();
    let previous = with_slot(|slot| {
        let next = slot.borrow().with_segment(segment);
        slot.replace(next)
    });
    ContextGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// sync_scope runs `f` in a slot of its own with `segment` current on top of
/// the caller's chain. It works on any thread, including runtime workers and
/// blocking pool threads, and the slot is gone once `f` returns or unwinds.
pub fn sync_scope<R>(segment: impl Into<Segment>, f: impl FnOnce() -> R) -> R {
    let carrier = current().with_segment(segment);
    CURRENT.sync_scope(RefCell::new(carrier), f)
}

/// scope runs `fut` with `segment` current on top of the caller's chain.
pub fn scope<F: Future>(segment: impl Into<Segment>, fut: F) -> impl Future<Output = F::Output> {
    let carrier = current().with_segment(segment);
    CURRENT.scope(RefCell::new(carrier), fut)
}

/// propagate runs `fut` in its own slot, starting from the caller's chain.
/// Segments started inside the future stay invisible to the caller.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(RefCell::new(current()), fut)
}

/// scope_with runs `fut` in its own slot starting from `carrier`.
pub fn scope_with<F: Future>(carrier: ContextCarrier, fut: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(RefCell::new(carrier), fut)
}
