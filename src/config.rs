//! Profiler core configuration.
//!
//! Everything here is fixed at [`ProfilerCore`](crate::ProfilerCore)
//! construction; the counting paths never consult configuration.

/// Configuration for the snapshot counting core.
///
/// # Example
///
/// ```ignore
/// use heapscope::ProfilerConfig;
///
/// let config = ProfilerConfig {
///     collect_reference_tree: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Record per-reference-edge breakdowns and stamp the reference-tree
    /// bit into the snapshot magic.
    ///
    /// Default: false
    pub collect_reference_tree: bool,

    /// Maximum number of idle snapshot containers kept for reuse.
    ///
    /// Two containers cover the steady state (one being filled, one being
    /// drained); anything beyond that only holds memory.
    ///
    /// Default: 2
    pub pool_capacity: usize,

    /// Initial capacity of the class maps (registry index and the
    /// per-snapshot counter map).
    ///
    /// Sized for the host's loaded-class count to avoid rehashing during
    /// the first walk.
    ///
    /// Default: 1024
    pub initial_class_capacity: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            collect_reference_tree: false,
            pool_capacity: 2,
            initial_class_capacity: 1024,
        }
    }
}

impl ProfilerConfig {
    /// Configuration with per-edge reference breakdowns enabled.
    pub fn with_reference_tree() -> Self {
        Self {
            collect_reference_tree: true,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::PoolCapacityZero);
        }
        if self.initial_class_capacity == 0 {
            return Err(ConfigError::ClassCapacityZero);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The container pool must hold at least one idle container.
    PoolCapacityZero,
    /// The class maps must be pre-sized for at least one class.
    ClassCapacityZero,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::PoolCapacityZero => write!(f, "pool capacity must be at least 1"),
            ConfigError::ClassCapacityZero => {
                write!(f, "initial class capacity must be at least 1")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
