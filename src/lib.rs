//! Identical code folding (ICF) for ELF input sections. Given an already-parsed collection of
//! object files, finds sections whose contents and outgoing references are equivalent, picks a
//! single survivor ("leader") for each equivalence class and redirects all symbols at the rest.
//! Downstream layout then skips the killed duplicates, shrinking the output file without
//! changing program behaviour.
//!
//! The input model lives in [`input_data`], [`section`] and [`symbol`]; the pass itself is
//! [`icf::fold_identical_sections`].

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod args;
pub mod elf;
pub mod error;
pub(crate) mod hash;
pub mod icf;
pub mod input_data;
pub mod section;
pub mod symbol;
pub(crate) mod timing;

pub use icf::fold_identical_sections;

pub(crate) use anyhow::bail;

/// Installs a default `tracing` subscriber that reads its filter from the environment. Callers
/// that embed this crate into a larger linker will generally install their own subscriber
/// instead and shouldn't call this.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}
