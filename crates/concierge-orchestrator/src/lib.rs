mod clarify;
mod machine;

pub use clarify::*;
pub use machine::*;
