//! Configuration for the fold pass. This crate is a library, so there's no flag parsing here;
//! the embedding linker maps whatever command-line surface it has onto this struct.

use rayon::ThreadPoolBuilder;
use std::num::NonZeroUsize;

#[derive(Debug, Default)]
pub struct Args {
    /// Report each folded equivalence class and the total bytes saved.
    pub print_icf_sections: bool,

    /// Number of worker threads to use. `None` means use all available parallelism.
    pub num_threads: Option<NonZeroUsize>,
}

impl Args {
    /// Sets up the global rayon thread pool. The pool might already be initialised, e.g. by the
    /// embedding linker or by an earlier call, in which case the existing pool is kept.
    pub fn setup_thread_pool(&self) {
        let num_threads = self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap())
        });

        let _ = ThreadPoolBuilder::new()
            .num_threads(num_threads.get())
            .build_global();
    }
}
