//! NewsBias runtime — ensemble scoring pipeline.
//!
//! The [`Orchestrator`] runs every roster model against one article, hands the
//! usable scores to the [`calculator`], persists the run and reports each step
//! through the [`ProgressManager`]. The [`RetrySweep`] periodically resubmits
//! failed articles until they succeed or escalate.

pub mod calculator;
pub mod orchestrator;
pub mod progress;
pub mod sweep;
pub mod transition;
pub mod types;

pub use orchestrator::Orchestrator;
pub use progress::{ProgressManager, ProgressWriter, Subscription};
pub use sweep::RetrySweep;
pub use types::*;
