//! The collection trigger.
//!
//! Heap objects are reference counted, so most garbage disappears the moment its last [Value]
//! goes away. What reference counting cannot see (cycles, host-side buffers) is the host's job:
//! the VM counts dispatched instructions and, every so often, stops the world and calls the
//! host's [CollectHook]. It also calls it once when a script finishes.
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use blox::gc::{CollectReason, Collector};
//!
//! let passes = Rc::new(Cell::new(0));
//! let seen = Rc::clone(&passes);
//!
//! let mut collector = Collector::new(3);
//! collector.set_hook(Box::new(move |_stats| seen.set(seen.get() + 1)));
//!
//! for _ in 0..7 {
//!     if collector.tick() {
//!         collector.collect(CollectReason::Periodic, 0);
//!     }
//! }
//! assert_eq!(2, passes.get());
//! ```
//!
//! [Value]: crate::value::Value

/// Called on every collection pass.
pub type CollectHook = Box<dyn FnMut(&CollectionStats)>;

/// Why a collection pass happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectReason {
    /// The instruction counter ran out.
    Periodic,
    /// A script ran to completion.
    Completion,
}

/// What the VM reports to the [CollectHook].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// How many passes have run, including this one.
    pub passes: usize,
    /// Instructions dispatched since the VM was created.
    pub instructions: u64,
    /// Live slots on the value stack when the pass started.
    pub stack_slots: usize,
}

/// Counts instructions and decides when the next collection pass is due.
pub struct Collector {
    interval: usize,
    countdown: usize,
    stats: CollectionStats,
    hook: Option<CollectHook>,
}

impl Collector {
    /// A collector that triggers once every `interval` instructions.
    pub fn new(interval: usize) -> Self {
        let interval = interval.max(1);
        Collector {
            interval,
            countdown: interval,
            stats: CollectionStats::default(),
            hook: None,
        }
    }

    /// Installs the host's collection routine, replacing any previous one.
    pub fn set_hook(&mut self, hook: CollectHook) {
        self.hook = Some(hook);
    }

    /// Counts one dispatched instruction. Returns true when a collection pass is due.
    #[inline]
    pub fn tick(&mut self) -> bool {
        self.stats.instructions += 1;
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = self.interval;
            true
        } else {
            false
        }
    }

    /// Runs one full collection pass.
    pub fn collect(&mut self, reason: CollectReason, stack_slots: usize) {
        self.stats.passes += 1;
        self.stats.stack_slots = stack_slots;
        tracing::debug!(
            ?reason,
            passes = self.stats.passes,
            instructions = self.stats.instructions,
            stack_slots,
            "collection pass"
        );

        if let Some(hook) = self.hook.as_mut() {
            hook(&self.stats);
        }
    }

    /// Statistics as of the last pass (the instruction count is always current).
    pub fn stats(&self) -> &CollectionStats {
        &self.stats
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("interval", &self.interval)
            .field("countdown", &self.countdown)
            .field("stats", &self.stats)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
