use crate::error::Result;
use crate::runtime::Runtime;

/// Average wall time in milliseconds of `launch` over `rounds` runs.
///
/// Launches may be asynchronous, so the stream is drained before the clock
/// starts and again before it is read at the end; the measurement covers
/// completed device work only.
pub fn timeit<F>(runtime: &dyn Runtime, warmup: usize, rounds: usize, mut launch: F) -> Result<f64>
where
    F: FnMut() -> Result<()>,
{
    let rounds = rounds.max(1);
    for _ in 0..warmup {
        launch()?;
    }
    runtime.synchronize()?;
    let start = runtime.now();
    for _ in 0..rounds {
        launch()?;
    }
    runtime.synchronize()?;
    let end = runtime.now();
    let elapsed = end.saturating_duration_since(start);
    Ok(elapsed.as_secs_f64() * 1e3 / rounds as f64)
}
