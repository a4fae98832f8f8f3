//! Composite steps.
//!
//! - [`SequentialSystem`]: children run one after another, each consuming the
//!   previous output.
//! - [`ParallelSystem`]: children all receive the same input, run
//!   concurrently, and a [`MergeStrategy`] combines their outputs.

pub mod merge;
pub mod parallel;
pub mod sequential;

pub use merge::{MergeLogic, MergeStrategy};
pub use parallel::ParallelSystem;
pub use sequential::SequentialSystem;

/// Path segment of the `index`-th child of a system labelled `label`.
pub(crate) fn child_segment(label: &str, index: usize) -> String {
    format!("{label}[{index}]")
}
