//! Value cleaning with a scalar reference and a lane-batched fast path.
//!
//! Readings beyond the physical range of any deployed sensor are treated as
//! faults and zeroed. Both backends produce identical output, so the rest of
//! the pipeline never needs to know which one is active.
//!
//! Workers clean one reading at a time through [`AccelerationManager::clean`],
//! which is the scalar rule on every backend. The selected backend only
//! changes [`AccelerationManager::clean_batch`], offered to embedders that
//! buffer readings (see `StreamProcessor::clean_batch`).

pub mod cpu;
pub mod simd;

use tracing::{info, warn};

use crate::config::BackendPreference;

/// Magnitude beyond which a reading is a sensor fault.
pub const FAULT_LIMIT: f64 = 1e6;

/// Which cleaning path is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Fixed-width lanes the compiler can vectorize.
    Simd,
    /// One value at a time. Reference implementation.
    Scalar,
}

/// A pluggable value-cleaning step.
pub trait CleaningStage: Send + Sync {
    fn backend(&self) -> Backend;

    fn clean(&self, value: f64) -> f64;

    fn clean_batch(&self, values: &mut [f64]);
}

/// Picks a cleaning stage at startup and dispatches to it.
pub struct AccelerationManager {
    simd_available: bool,
    stage: Box<dyn CleaningStage>,
}

impl AccelerationManager {
    pub fn new(preference: BackendPreference) -> Self {
        let simd_available = detect_simd();
        let backend = select_backend(preference, simd_available);
        let stage: Box<dyn CleaningStage> = match backend {
            Backend::Simd => Box::new(simd::LaneStage),
            Backend::Scalar => Box::new(cpu::ScalarStage),
        };

        info!(
            ?preference,
            simd_available,
            ?backend,
            "acceleration manager initialized"
        );

        Self {
            simd_available,
            stage,
        }
    }

    pub fn backend(&self) -> Backend {
        self.stage.backend()
    }

    pub fn simd_available(&self) -> bool {
        self.simd_available
    }

    pub fn clean(&self, value: f64) -> f64 {
        self.stage.clean(value)
    }

    /// Clean a batch in place.
    ///
    /// Debug builds re-run the batch through the scalar reference and warn
    /// on any difference.
    pub fn clean_batch(&self, values: &mut [f64]) {
        #[cfg(debug_assertions)]
        let reference: Option<Vec<f64>> = (self.backend() != Backend::Scalar).then(|| {
            let mut copy = values.to_vec();
            cpu::ScalarStage.clean_batch(&mut copy);
            copy
        });

        self.stage.clean_batch(values);

        #[cfg(debug_assertions)]
        if let Some(reference) = reference {
            let matches = reference
                .iter()
                .zip(values.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits());
            if matches {
                tracing::debug!(backend = ?self.backend(), len = values.len(), "cleaning verification passed");
            } else {
                warn!(
                    backend = ?self.backend(),
                    "cleaning mismatch: backend output differs from scalar reference"
                );
            }
        }
    }
}

impl Default for AccelerationManager {
    fn default() -> Self {
        Self::new(BackendPreference::Auto)
    }
}

fn select_backend(preference: BackendPreference, simd_available: bool) -> Backend {
    match preference {
        BackendPreference::Scalar => Backend::Scalar,
        BackendPreference::Auto if simd_available => Backend::Simd,
        BackendPreference::Auto => Backend::Scalar,
        BackendPreference::Simd if simd_available => Backend::Simd,
        BackendPreference::Simd => {
            warn!("SIMD backend requested but not supported on this host, using scalar");
            Backend::Scalar
        }
    }
}

fn detect_simd() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("avx2")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("neon")
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}
