//! Application services layer.

pub mod error;
pub mod role;
pub mod todo;
