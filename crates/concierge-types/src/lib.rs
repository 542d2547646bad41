mod event;
mod intent;
mod outcome;
mod schema;
mod session;
mod task;

pub use event::*;
pub use intent::*;
pub use outcome::*;
pub use schema::*;
pub use session::*;
pub use task::*;
