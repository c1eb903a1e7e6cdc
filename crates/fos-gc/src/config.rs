//! GC Coordination Configuration

/// Garbage collection coordination options
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Ceiling on passes run by the repeated-collection entry point.
    /// Each native/script hop in a reference chain costs one pass.
    pub max_convergence_passes: usize,

    /// Snapshot retainer information at every prologue
    pub record_retainers: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_convergence_passes: 5,
            record_retainers: true,
        }
    }
}

impl GcConfig {
    /// Set the convergence pass ceiling
    pub fn with_max_convergence_passes(mut self, passes: usize) -> Self {
        self.max_convergence_passes = passes;
        self
    }

    pub fn with_record_retainers(mut self, record: bool) -> Self {
        self.record_retainers = record;
        self
    }
}
