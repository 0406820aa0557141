//! Process-wide configuration (SPEC_FULL.md §11.3).
//!
//! The handful of knobs the core needs that spec.md leaves implicit. Constructed once,
//! usually right before the first `lithe_sched_enter`, and threaded down rather than read
//! from the environment — the same way the teacher's kernel takes its configuration from
//! boot-time parsing, not env vars.

/// Default per-task stack size: 1 MiB, matching common green-thread defaults and the
/// teacher's own `lineup` usage of multi-page stacks for its uthreads.
pub const DEFAULT_TASK_STACK_SIZE: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct LitheConfig {
    /// How many vcores to request for the root 2LS the first time it enters.
    pub initial_vcores: usize,
    /// Ceiling on how many vcores this process will ever hold at once.
    pub max_vcores: usize,
    /// Size of the backing-thread pool used to simulate async blocking syscalls. The
    /// original sizes this at `max_vcores * 2`; see SPEC_FULL.md §12.
    pub backing_threads: usize,
    /// Default stack size for tasks created without an explicit size.
    pub task_stack_size: usize,
    /// Whether a freshly-created task starts with asynchronous notifications enabled
    /// (spec.md §5: "suppressed by default").
    pub notifs_enabled_by_default: bool,
}

impl Default for LitheConfig {
    fn default() -> Self {
        let max_vcores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        LitheConfig {
            initial_vcores: 1,
            max_vcores,
            backing_threads: max_vcores * 2,
            task_stack_size: DEFAULT_TASK_STACK_SIZE,
            notifs_enabled_by_default: false,
        }
    }
}

impl LitheConfig {
    pub fn with_max_vcores(mut self, n: usize) -> Self {
        self.max_vcores = n;
        self.backing_threads = n * 2;
        self
    }

    pub fn with_initial_vcores(mut self, n: usize) -> Self {
        self.initial_vcores = n;
        self
    }

    pub fn with_task_stack_size(mut self, n: usize) -> Self {
        self.task_stack_size = n;
        self
    }
}
