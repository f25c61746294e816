//! Wire and domain types shared by every component.

mod canonical;
mod checkpoint;
mod decision;
mod envelope;
mod identifiers;
mod registry;
mod topic;

pub use canonical::*;
pub use checkpoint::*;
pub use decision::*;
pub use envelope::*;
pub use identifiers::*;
pub use registry::*;
pub use topic::*;
