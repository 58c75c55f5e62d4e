pub mod recording_runtime;
pub mod smoke;
pub mod synth;

use std::sync::Arc;

use tunegraph::kernel::{KernelKey, MemBoundKernel};
use tunegraph::synth::{BuiltinSynthesizer, SynthTarget, Synthesizer};
use tunegraph::{DType, KernelRegistry, OpKind, Runtime};

pub use recording_runtime::{RecordingRuntime, RuntimeEvent, INJECTED_COMPILER_FAULT};
pub use synth::{BrokenSynthesizer, CountingSynthesizer};

/// What a backend crate hands to the shared suite.
pub struct BackendHarness {
    pub runtime: Arc<dyn Runtime>,
    pub register: fn(&KernelRegistry),
    /// Source dialect the backend's compiler accepts.
    pub synth_target: SynthTarget,
}

impl BackendHarness {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        register: fn(&KernelRegistry),
        synth_target: SynthTarget,
    ) -> Self {
        Self {
            runtime,
            register,
            synth_target,
        }
    }

    /// Fresh registry holding the backend's kernels.
    pub fn registry(&self) -> KernelRegistry {
        let registry = KernelRegistry::new();
        (self.register)(&registry);
        registry
    }

    /// Backend registry whose MemBound kernel uses `synthesizer`.
    pub fn registry_with_synthesizer(&self, synthesizer: Arc<dyn Synthesizer>) -> KernelRegistry {
        let registry = self.registry();
        registry.register(
            KernelKey::new(self.runtime.device(), OpKind::MemBound, DType::Float32),
            "MemBound_Jit_Test",
            Arc::new(MemBoundKernel::new(synthesizer, self.synth_target)),
        );
        registry
    }

    /// Backend registry whose MemBound kernel counts synthesis calls.
    pub fn counting_registry(&self) -> (KernelRegistry, Arc<CountingSynthesizer>) {
        let counting = Arc::new(CountingSynthesizer::new(Arc::new(BuiltinSynthesizer::new())));
        let registry = self.registry_with_synthesizer(counting.clone());
        (registry, counting)
    }

    pub fn recording(&self) -> Arc<RecordingRuntime> {
        Arc::new(RecordingRuntime::new(Arc::clone(&self.runtime)))
    }
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        let diff = (a - e).abs();
        assert!(
            diff <= tol * (1.0 + e.abs()),
            "mismatch at {idx}: got {a}, expected {e} (diff {diff})"
        );
    }
}

/// Expands to a test module running the shared suite. `$harness_ctor`
/// returns `Option<BackendHarness>`; `None` skips every test, which is how
/// device backends behave on machines without the device.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $harness_ctor:expr) => {
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::smoke;

            macro_rules! backend_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let Some(harness) = ($harness_ctor)() else {
                            eprintln!("skipping {}: device unavailable", stringify!($name));
                            return;
                        };
                        smoke::$name(&harness);
                    }
                };
            }

            backend_test!(elementwise_add_broadcasts);
            backend_test!(matmul_matches_expected);
            backend_test!(copy_kernels_preserve_bytes);
            backend_test!(membound_compute_without_record_fails);
            backend_test!(membound_end_to_end_4x4);
            backend_test!(membound_broadcast_matches_reference);
            backend_test!(tuning_twice_is_bit_identical);
            backend_test!(record_is_reused_without_recompiling);
            backend_test!(benchmark_synchronizes_before_end_clock);
            backend_test!(module_released_after_failed_launch);
            backend_test!(compile_failure_reports_log);
            backend_test!(compiler_error_keeps_log);
            backend_test!(unsupported_lookup_touches_no_device);
            backend_test!(record_rejected_for_other_configuration);
            backend_test!(executor_runs_mixed_graph);
        }
    };
}
