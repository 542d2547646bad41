pub mod catalog;
pub mod executor;
pub mod normalize;
pub mod registry;
pub mod validate;

pub use catalog::*;
pub use executor::*;
pub use normalize::*;
pub use registry::*;
pub use validate::*;
