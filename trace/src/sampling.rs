use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::basetypes::TraceID;

/// Sampler decides whether a trace should be sampled and exported.
///
/// It is consulted once, when a transaction starts a new trace. Transactions
/// continuing an upstream trace and every span inherit the existing decision.
pub type Sampler = Arc<dyn Fn(SamplingParameters<'_>) -> SamplingDecision + Send + Sync>;

/// SamplingParameters contains the values passed to a Sampler.
pub struct SamplingParameters<'a> {
    pub trace_id: &'a TraceID,
    pub name: &'a str,
}

/// SamplingDecision is the result of consulting a Sampler.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SamplingDecision {
    pub sample: bool,
}

/// is_valid_ratio reports whether a configured sample ratio is usable.
pub fn is_valid_ratio(fraction: f64) -> bool {
    fraction.is_finite() && (0.0..=1.0).contains(&fraction)
}

/// probability_sampler returns a Sampler that keeps the given fraction of traces.
///
/// The decision is a pure function of the upper 63 bits of the trace id, so any
/// process applying the same ratio to the same trace id reaches the same answer.
pub fn probability_sampler(fraction: f64) -> Sampler {
    if fraction.is_nan() || fraction <= 0.0 {
        return never_sample();
    } else if fraction >= 1.0 {
        return always_sample();
    }

    let bound = (fraction * (1u64 << 63) as f64).floor() as u64;
    Arc::new(move |params: SamplingParameters<'_>| SamplingDecision {
        sample: (BigEndian::read_u64(&params.trace_id.0[..8]) >> 1) < bound,
    })
}

/// always_sample keeps every trace. This is what a rate of 1.0 selects.
pub fn always_sample() -> Sampler {
    Arc::new(|_| SamplingDecision { sample: true })
}

pub fn never_sample() -> Sampler {
    Arc::new(|_| SamplingDecision { sample: false })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::id_generator::{IDGenerator, SeededIDGenerator};

    fn decide(sampler: &Sampler, trace_id: &TraceID) -> bool {
        sampler(SamplingParameters {
            trace_id,
            name: "GET /",
        })
        .sample
    }

    #[test]
    fn decision_is_deterministic_for_a_trace_id() {
        let sampler = probability_sampler(0.5);
        let other = probability_sampler(0.5);
        let generator = SeededIDGenerator::new(7);
        for _ in 0..100 {
            let trace_id = generator.new_trace_id();
            assert_eq!(decide(&sampler, &trace_id), decide(&sampler, &trace_id));
            assert_eq!(decide(&sampler, &trace_id), decide(&other, &trace_id));
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let run = || {
            let generator = SeededIDGenerator::new(1234);
            let sampler = probability_sampler(0.25);
            (0..500)
                .map(|_| decide(&sampler, &generator.new_trace_id()))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn probability_sampler_samples_approximately() {
        let generator = SeededIDGenerator::new(99);
        let sampler = probability_sampler(0.3);
        let kept = (0..10_000)
            .filter(|_| decide(&sampler, &generator.new_trace_id()))
            .count();
        // 10k draws at p=0.3 has a standard deviation of ~46
        assert!(
            (2700..=3300).contains(&kept),
            "want approx 30% got {}",
            kept as f64 / 100.0
        );
    }

    #[test]
    fn boundary_ratios() {
        let generator = SeededIDGenerator::new(3);
        let all = probability_sampler(1.0);
        let none = probability_sampler(0.0);
        for _ in 0..100 {
            let trace_id = generator.new_trace_id();
            assert!(decide(&all, &trace_id));
            assert!(!decide(&none, &trace_id));
        }
        assert!(!decide(&probability_sampler(-1.0), &generator.new_trace_id()));
    }

    #[test]
    fn ratio_validation() {
        assert!(is_valid_ratio(0.0));
        assert!(is_valid_ratio(1.0));
        assert!(is_valid_ratio(0.42));
        assert!(!is_valid_ratio(1.5));
        assert!(!is_valid_ratio(-0.1));
        assert!(!is_valid_ratio(f64::NAN));
    }
}
