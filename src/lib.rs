// Re-export the core crate so callers need only one dependency
pub use callcore;

pub mod calls;
pub mod config;
pub mod store;
