pub mod actor;

pub use actor::{Actor, require_actor};
