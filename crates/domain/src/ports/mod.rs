pub mod command;
pub mod ownership;

pub use command::*;
pub use ownership::*;
