pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

/// Per-instance execution limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Units of fuel available to the instance. `None` disables metering.
    pub fuel: Option<u64>,
    /// Maximum number of nested calls before `Trap::StackOverflow`.
    pub max_call_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fuel: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}
