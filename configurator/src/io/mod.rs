//! I/O helpers for engine commands.

pub mod config;
pub mod host;
pub mod launcher;
pub mod logic;
pub mod process;
pub mod project;
