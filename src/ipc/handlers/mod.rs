pub mod catalog;
pub mod config;
pub mod core;
pub mod curriculum;
pub mod preferences;
pub mod session;
pub mod turmas;
pub mod wizard;
