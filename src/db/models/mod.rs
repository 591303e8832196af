//! Database models, one module per table.

pub mod attempt;
pub mod auth;
pub mod enrollment;

pub use attempt::*;
pub use auth::*;
pub use enrollment::*;
