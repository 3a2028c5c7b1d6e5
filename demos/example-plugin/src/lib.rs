//! Example plugin library.
//!
//! Exports two text filters behind one interface. A host opens this library
//! through a `classload::Loader` and creates the filters by name:
//!
//! ```ignore
//! let loader = Loader::new(classload::library_filename("example_plugin"), true)?;
//! let filter = loader.create_shared::<dyn TextFilter>("ShoutFilter")?;
//! assert_eq!(filter.apply("hi"), "HI");
//! ```
//!
//! In a real deployment the interface trait lives in a crate shared by the
//! host and its plugins; it is defined here only to keep the example
//! self-contained.

use classload_sdk::export_plugin_class;

/// Transforms text; the interface this library's plugins implement.
pub trait TextFilter: Send + Sync {
    /// Apply the filter to `input`.
    fn apply(&self, input: &str) -> String;
}

/// Upper-cases its input.
#[derive(Default)]
pub struct ShoutFilter;

impl TextFilter for ShoutFilter {
    fn apply(&self, input: &str) -> String {
        input.to_uppercase()
    }
}

/// Reverses its input.
#[derive(Default)]
pub struct ReverseFilter;

impl TextFilter for ReverseFilter {
    fn apply(&self, input: &str) -> String {
        input.chars().rev().collect()
    }
}

export_plugin_class!(ShoutFilter, TextFilter);
export_plugin_class!(ReverseFilter, TextFilter, "text filters registered");
