use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`Repository`](crate::Repository).
///
/// Deserializable so it can be embedded in an application's own config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Refresh the snapshot when the new step is a multiple of this value.
    /// `1` refreshes after every command, `0` never writes snapshots.
    pub snapshot_every: u64,
}

impl RepositoryConfig {
    pub fn should_snapshot(&self, step: u64) -> bool {
        self.snapshot_every != 0 && step % self.snapshot_every == 0
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self { snapshot_every: 1 }
    }
}
