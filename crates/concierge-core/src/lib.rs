pub mod config;
pub mod engine;
pub mod event_bus;
pub mod router;
pub mod store;

pub use config::*;
pub use engine::*;
pub use event_bus::*;
pub use router::*;
pub use store::*;
