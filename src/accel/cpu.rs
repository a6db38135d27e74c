use crate::accel::{Backend, CleaningStage, FAULT_LIMIT};

/// Scalar reference implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarStage;

/// Zero faulted readings, pass everything else through.
#[inline]
pub fn clean_value(value: f64) -> f64 {
    if value.is_finite() && value.abs() <= FAULT_LIMIT {
        value
    } else {
        0.0
    }
}

impl CleaningStage for ScalarStage {
    fn backend(&self) -> Backend {
        Backend::Scalar
    }

    fn clean(&self, value: f64) -> f64 {
        clean_value(value)
    }

    fn clean_batch(&self, values: &mut [f64]) {
        for v in values.iter_mut() {
            *v = clean_value(*v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_value() {
        assert_eq!(clean_value(12.5), 12.5);
        assert_eq!(clean_value(-FAULT_LIMIT), -FAULT_LIMIT);
        assert_eq!(clean_value(1_000_001.0), 0.0);
        assert_eq!(clean_value(-5e9), 0.0);
        assert_eq!(clean_value(f64::NAN), 0.0);
        assert_eq!(clean_value(f64::NEG_INFINITY), 0.0);
    }
}
