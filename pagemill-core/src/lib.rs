//! Shared types for pagemill: commands, process status snapshots, errors,
//! shell escaping and command templates.

pub mod error;
pub mod escape;
pub mod models;
pub mod template;

pub use error::{PagemillError, Result};
pub use models::*;
pub use template::{CommandTemplate, TemplateTable};
