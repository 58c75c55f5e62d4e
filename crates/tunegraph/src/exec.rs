use std::sync::Arc;

use crate::env::TuneConfig;
use crate::error::Result;
use crate::graph::{Graph, OpId, Operator};
use crate::kernel::{
    dispatch_dtype, operator_signature, DiskRecordCache, Kernel, KernelContext, KernelRegistry,
    PerfRecord, RecordCache,
};
use crate::runtime::Runtime;

/// Runs graphs on one runtime, tuning operators that need it on first
/// execution and reusing their records afterwards.
pub struct Executor<'r> {
    runtime: Arc<dyn Runtime>,
    registry: &'r KernelRegistry,
    config: TuneConfig,
    records: RecordCache,
    disk: Option<DiskRecordCache>,
}

impl<'r> Executor<'r> {
    pub fn new(runtime: Arc<dyn Runtime>, registry: &'r KernelRegistry) -> Self {
        Self::with_config(runtime, registry, TuneConfig::default())
    }

    pub fn with_config(
        runtime: Arc<dyn Runtime>,
        registry: &'r KernelRegistry,
        config: TuneConfig,
    ) -> Self {
        let disk = config.record_cache_dir.clone().map(DiskRecordCache::new);
        Self {
            runtime,
            registry,
            config,
            records: RecordCache::new(),
            disk,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn config(&self) -> &TuneConfig {
        &self.config
    }

    pub fn record(&self, op: OpId) -> Option<Arc<PerfRecord>> {
        self.records.get(op)
    }

    pub fn records(&self) -> &RecordCache {
        &self.records
    }

    pub fn clear_records(&self) {
        self.records.clear();
    }

    fn kernel_for(&self, graph: &Graph, op: &Operator) -> Result<Arc<dyn Kernel>> {
        let dtype = dispatch_dtype(graph, op)?;
        self.registry.lookup(self.runtime.device(), op.kind(), dtype)
    }

    /// Executes every operator in dependency order. Launches may still be in
    /// flight when this returns; call `synchronize` on the runtime (or read a
    /// tensor back) to wait for them.
    pub fn run(&self, graph: &Graph) -> Result<()> {
        for op_id in graph.topo_order()? {
            let op = graph.operator(op_id)?;
            let kernel = self.kernel_for(graph, op)?;
            let ctx = KernelContext::new(graph, op, self.runtime.as_ref());
            if kernel.requires_tuning() {
                let record = self.record_or_tune(kernel.as_ref(), &ctx)?;
                kernel.compute_with_record(&ctx, &record)?;
            } else {
                kernel.compute(&ctx)?;
            }
        }
        Ok(())
    }

    /// Tunes every operator that requires it and has no record yet. Returns
    /// the number of records produced or loaded.
    pub fn tune_graph(&self, graph: &Graph) -> Result<usize> {
        let mut tuned = 0;
        for op_id in graph.topo_order()? {
            let op = graph.operator(op_id)?;
            let kernel = self.kernel_for(graph, op)?;
            if !kernel.requires_tuning() || self.records.get(op_id).is_some() {
                continue;
            }
            let ctx = KernelContext::new(graph, op, self.runtime.as_ref());
            self.record_or_tune(kernel.as_ref(), &ctx)?;
            tuned += 1;
        }
        Ok(tuned)
    }

    fn record_or_tune(&self, kernel: &dyn Kernel, ctx: &KernelContext<'_>) -> Result<Arc<PerfRecord>> {
        let op = ctx.op().id();
        if let Some(record) = self.records.get(op) {
            return Ok(record);
        }
        if let Some(disk) = &self.disk {
            if let Some(record) = disk.load(operator_signature(ctx)?)? {
                return Ok(self.records.insert(op, record));
            }
        }

        let record = kernel.tune(ctx, &self.config)?;
        if let Some(disk) = &self.disk {
            disk.store(&record)?;
        }
        Ok(self.records.insert(op, record))
    }
}
