use std::sync::Arc;

use tunegraph::synth::SynthTarget;
use tunegraph_backend_host::{register_host_kernels, HostRuntime};
use tunegraph_backend_tests::BackendHarness;

fn host_harness() -> Option<BackendHarness> {
    Some(BackendHarness::new(
        Arc::new(HostRuntime::new()),
        register_host_kernels,
        SynthTarget::HostIr,
    ))
}

tunegraph_backend_tests::define_backend_tests!(host_backend, host_harness);
