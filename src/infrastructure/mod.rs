//! Infrastructure layer - Backend implementations and storage services

pub mod backend;
pub mod logging;
pub mod store;
