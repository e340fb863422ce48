//! Explicit execution context shared by the trainer and evaluator.
//!
//! A [`Session`] owns the compute device and the parameter store. It is
//! created once per run and passed to every component that builds or reads
//! model parameters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

/// Device plus parameter store for one run.
pub struct Session {
    device: Device,
    var_map: VarMap,
}

impl Session {
    /// Create a session on the given device with an empty parameter store.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            var_map: VarMap::new(),
        }
    }

    /// Create a CPU session.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// Pick the training device from the environment.
    ///
    /// Uses CUDA when the `cuda` feature is enabled and a device is present,
    /// unless `COMPETE_FORCE_CPU` is set. `COMPETE_CUDA_DEVICE` selects the
    /// ordinal.
    pub fn from_env() -> Self {
        let force_cpu = std::env::var("COMPETE_FORCE_CPU")
            .ok()
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let ordinal = std::env::var("COMPETE_CUDA_DEVICE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let device = if !force_cpu && cfg!(feature = "cuda") {
            match Device::cuda_if_available(ordinal) {
                Ok(device @ Device::Cuda(_)) => {
                    tracing::info!("Compute device: CUDA (device {})", ordinal);
                    device
                }
                Ok(_) => {
                    tracing::warn!("CUDA not available; falling back to CPU");
                    Device::Cpu
                }
                Err(err) => {
                    tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                    Device::Cpu
                }
            }
        } else {
            if force_cpu {
                tracing::info!("CPU mode forced via COMPETE_FORCE_CPU");
            }
            Device::Cpu
        };

        Self::new(device)
    }

    /// Compute device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter store. Clones share the same variables.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// F32 variable builder backed by this session's parameter store.
    pub fn var_builder(&self) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.var_map, DType::F32, &self.device)
    }

    /// Total number of scalar parameters currently registered.
    pub fn parameter_count(&self) -> usize {
        self.var_map
            .all_vars()
            .iter()
            .map(|v| v.elem_count())
            .sum()
    }
}

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_session_starts_empty() {
        let session = Session::cpu();
        assert_eq!(session.parameter_count(), 0);
        assert!(session.device().is_cpu());
    }

    #[test]
    fn test_var_builder_registers_in_session() {
        let session = Session::cpu();
        let vb = session.var_builder();
        let _w = vb
            .get_with_hints((4, 3), "w", candle_nn::Init::Const(0.5))
            .unwrap();
        assert_eq!(session.parameter_count(), 12);
    }

    #[test]
    fn test_cancellation_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
