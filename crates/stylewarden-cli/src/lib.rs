//! Stylewarden command-line front-end.

pub mod commands;
pub mod output;
pub mod workspace;

pub use workspace::Workspace;
