//! Engine configuration.

/// What to do when an insert carries a key that is already bound to a
/// different row.
///
/// Re-inserting an identical row is always a no-op regardless of policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyConflictPolicy {
    /// Reject the whole batch with `EngineError::KeyConflict`.
    #[default]
    Reject,
    /// Last write wins, in batch order.
    Replace,
}

/// Tunables for an [`Engine`](crate::engine::Engine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on semi-naive iterations per stratum per step.
    pub max_fixpoint_iterations: usize,
    pub key_conflict: KeyConflictPolicy,
    /// When false the engine never deletes rows; derived output is identical,
    /// only memory use differs.
    pub rse_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fixpoint_iterations: 1000,
            key_conflict: KeyConflictPolicy::Reject,
            rse_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_fixpoint_iterations(mut self, max: usize) -> Self {
        self.max_fixpoint_iterations = max;
        self
    }

    pub fn with_key_conflict(mut self, policy: KeyConflictPolicy) -> Self {
        self.key_conflict = policy;
        self
    }

    pub fn with_rse(mut self, enabled: bool) -> Self {
        self.rse_enabled = enabled;
        self
    }
}
