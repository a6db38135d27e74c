//! Lane-batched cleaning.
//!
//! Values are processed in fixed-width chunks with a branch-free select so
//! the loop body lowers to vector compares and blends on AVX2 and NEON.

use crate::accel::cpu::clean_value;
use crate::accel::{Backend, CleaningStage, FAULT_LIMIT};

const LANES: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct LaneStage;

impl CleaningStage for LaneStage {
    fn backend(&self) -> Backend {
        Backend::Simd
    }

    fn clean(&self, value: f64) -> f64 {
        clean_value(value)
    }

    fn clean_batch(&self, values: &mut [f64]) {
        let mut chunks = values.chunks_exact_mut(LANES);
        for chunk in &mut chunks {
            let mut mask = [0.0f64; LANES];
            for (m, v) in mask.iter_mut().zip(chunk.iter()) {
                // NaN fails the compare.
                *m = if v.abs() <= FAULT_LIMIT { 1.0 } else { 0.0 };
            }
            for (v, m) in chunk.iter_mut().zip(mask) {
                *v = if m == 1.0 { *v } else { 0.0 };
            }
        }
        for v in chunks.into_remainder() {
            *v = clean_value(*v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remainder_is_cleaned() {
        let mut values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 2e7, f64::NAN];
        LaneStage.clean_batch(&mut values);
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_infinities_in_full_lanes() {
        let mut values = vec![f64::INFINITY, -1.0, f64::NEG_INFINITY, 1e6];
        LaneStage.clean_batch(&mut values);
        assert_eq!(values, vec![0.0, -1.0, 0.0, 1e6]);
    }
}
