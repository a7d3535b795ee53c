pub mod entities;
pub mod events;
pub mod ports;
pub mod repositories;
pub mod value_objects;

pub use chaos_core::{OrchestratorError, OrchestratorResult};
pub use entities::*;
pub use events::*;
pub use ports::*;
pub use repositories::*;
pub use value_objects::*;
