use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use rand_core::{OsRng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::basetypes::{SpanID, TraceID};

/// IDGenerator produces the identifiers used for traces, transactions and spans.
///
/// Implementations must be safe to call from many threads at once.
pub trait IDGenerator {
    fn new_trace_id(&self) -> TraceID;
    fn new_span_id(&self) -> SpanID;
}

lazy_static! {
    pub static ref DEFAULT_ID_GENERATOR: Arc<dyn IDGenerator + Send + Sync> =
        Arc::new(DefaultIDGenerator);
}

static FALLBACK_SEED: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);

thread_local! {
    // Each thread draws from its own stream so id generation never contends.
    static SOURCE: RefCell<Xoshiro256PlusPlus> = RefCell::new(new_source());
}

fn new_source() -> Xoshiro256PlusPlus {
    match Xoshiro256PlusPlus::from_rng(OsRng) {
        Ok(source) => source,
        Err(err) => {
            tracing::warn!("os entropy unavailable, seeding id generator from clock: {err}");
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            let salt = FALLBACK_SEED.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
            Xoshiro256PlusPlus::seed_from_u64(nanos ^ salt)
        }
    }
}

pub fn default_id_generator() -> Arc<dyn IDGenerator + Send + Sync> {
    Arc::clone(&DEFAULT_ID_GENERATOR)
}

/// DefaultIDGenerator draws ids from a per-thread xoshiro256++ stream seeded
/// from operating system entropy.
#[derive(Debug, Default)]
pub struct DefaultIDGenerator;

impl IDGenerator for DefaultIDGenerator {
    fn new_trace_id(&self) -> TraceID {
        SOURCE.with(|source| fill_trace_id(&mut *source.borrow_mut()))
    }

    fn new_span_id(&self) -> SpanID {
        SOURCE.with(|source| fill_span_id(&mut *source.borrow_mut()))
    }
}

/// SeededIDGenerator produces a reproducible id sequence from a fixed seed.
///
/// All callers share one stream, so the sequence is only reproducible when ids
/// are requested from a single thread.
#[derive(Debug)]
pub struct SeededIDGenerator {
    source: Mutex<Xoshiro256PlusPlus>,
}

impl SeededIDGenerator {
    pub fn new(seed: u64) -> Self {
        SeededIDGenerator {
            source: Mutex::new(Xoshiro256PlusPlus::seed_from_u64(seed)),
        }
    }
}

impl IDGenerator for SeededIDGenerator {
    fn new_trace_id(&self) -> TraceID {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        fill_trace_id(&mut *source)
    }

    fn new_span_id(&self) -> SpanID {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        fill_span_id(&mut *source)
    }
}

fn fill_trace_id(source: &mut impl RngCore) -> TraceID {
    let mut trace_id = TraceID::default();
    while !trace_id.is_valid() {
        source.fill_bytes(&mut trace_id.0[..]);
    }
    trace_id
}

fn fill_span_id(source: &mut impl RngCore) -> SpanID {
    let mut span_id = SpanID::default();
    while !span_id.is_valid() {
        source.fill_bytes(&mut span_id.0[..]);
    }
    span_id
}
