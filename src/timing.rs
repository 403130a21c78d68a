//! Phase timing. Each top-level phase of the fold runs inside a `tracing` span so that whatever
//! subscriber the embedding linker installs can report per-phase durations.

#[macro_export]
macro_rules! timing_phase {
    ($($args:tt)*) => {
        let _guard = tracing::info_span!($($args)*).entered();
    };
}
