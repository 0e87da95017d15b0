pub mod descriptor;
pub mod registry;
pub mod relation;

pub use descriptor::*;
pub use registry::*;
pub use relation::*;
