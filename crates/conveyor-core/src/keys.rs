//! Redis key naming
//!
//! All keys live under a single configurable namespace prefix so multiple
//! deployments can share one Redis instance without collisions.

use crate::job::JobState;

/// Key namer for every Redis structure the queue touches.
///
/// | Key | Type |
/// |---|---|
/// | `NS:id` | counter |
/// | `NS:job:<id>` | hash (`itemData`, `state`) |
/// | `NS:queue:<name>` | list |
/// | `NS:scheduled` | sorted set, score = due timestamp |
/// | `NS:state:<state>` | set |
/// | `NS:time-index` | sorted set, score = creation timestamp |
#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    /// Create a key namer for the given namespace prefix.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Get the configured namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Monotonic job id allocator key.
    pub fn id_counter(&self) -> String {
        format!("{}:id", self.namespace)
    }

    /// Canonical per-job record hash.
    pub fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    /// FIFO queue list for a job name.
    pub fn queue(&self, name: &str) -> String {
        format!("{}:queue:{}", self.namespace, name)
    }

    /// Sorted set of delayed / retry / ghost-delayed ids.
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    /// Index set of all ids currently in a given state.
    pub fn state(&self, state: JobState) -> String {
        format!("{}:state:{}", self.namespace, state)
    }

    /// Sorted set of ids by creation time.
    pub fn time_index(&self) -> String {
        format!("{}:time-index", self.namespace)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("conveyor")
    }
}
