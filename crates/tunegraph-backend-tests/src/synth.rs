use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tunegraph::synth::{SynthesisRequest, SynthesisResponse, Synthesizer};
use tunegraph::Result;

/// Forwards to another synthesizer and remembers every request.
pub struct CountingSynthesizer {
    inner: Arc<dyn Synthesizer>,
    calls: AtomicUsize,
    requests: Mutex<Vec<SynthesisRequest>>,
}

impl CountingSynthesizer {
    pub fn new(inner: Arc<dyn Synthesizer>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }
}

impl Synthesizer for CountingSynthesizer {
    fn name(&self) -> &str {
        "counting"
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("request log poisoned")
            .push(request.clone());
        self.inner.synthesize(request)
    }
}

/// Returns source no device compiler accepts.
pub struct BrokenSynthesizer;

impl Synthesizer for BrokenSynthesizer {
    fn name(&self) -> &str {
        "broken"
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        Ok(SynthesisResponse {
            source: format!("this is not a kernel {{ {} ", request.entry_point()),
            launch: [1, 1, 1, 32, 1, 1],
            aux: Default::default(),
        })
    }
}
