//! Knobs for the virtual machine.

/// Default maximum call depth.
pub const FRAMES_MAX: usize = 64;

/// Stack slots available to each call frame: one byte of slot operand.
pub const SLOTS_PER_FRAME: usize = u8::MAX as usize + 1;

/// Default number of instructions between two collection passes.
pub const GC_INTERVAL: usize = 1 << 16;

/// Longest string, in bytes, that `*` may build by repetition.
pub const MAX_STRING_LEN: usize = 1 << 30;

/// Default extension of bytecode cache files.
pub const CACHE_EXTENSION: &str = "bloxc";

/// Extension assumed for scripts and imported modules.
pub const SCRIPT_EXTENSION: &str = "blox";

/// Configuration of a [crate::vm::VM]. Build one with [VmConfig::default] and the `with_*`
/// methods:
///
/// ```
/// use blox::config::VmConfig;
/// let config = VmConfig::default()
///     .with_frames_max(16)
///     .with_script_args(vec!["input.txt".to_owned()]);
/// assert_eq!(16 * 256, config.stack_capacity());
/// ```
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum number of nested calls before "Stack overflow.".
    pub frames_max: usize,
    /// Instructions dispatched between two collection passes.
    pub gc_interval: usize,
    /// What `args()` returns.
    pub script_args: Vec<String>,
    /// Extension of bytecode cache files written next to scripts.
    pub cache_extension: String,
}

impl VmConfig {
    pub fn with_frames_max(mut self, frames_max: usize) -> Self {
        self.frames_max = frames_max.max(1);
        self
    }

    pub fn with_gc_interval(mut self, gc_interval: usize) -> Self {
        self.gc_interval = gc_interval.max(1);
        self
    }

    pub fn with_script_args(mut self, script_args: Vec<String>) -> Self {
        self.script_args = script_args;
        self
    }

    pub fn with_cache_extension(mut self, extension: impl Into<String>) -> Self {
        self.cache_extension = extension.into();
        self
    }

    /// The fixed capacity of the value stack.
    pub fn stack_capacity(&self) -> usize {
        self.frames_max * SLOTS_PER_FRAME
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            frames_max: FRAMES_MAX,
            gc_interval: GC_INTERVAL,
            script_args: Vec::new(),
            cache_extension: CACHE_EXTENSION.to_owned(),
        }
    }
}
