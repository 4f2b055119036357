pub mod agent;
pub mod order;
pub mod position;

pub use agent::*;
pub use order::*;
pub use position::*;
