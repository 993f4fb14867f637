pub mod allocator;
pub mod installer;
pub mod orchestrator;
pub mod plan;
pub mod readiness;
pub mod record;
pub mod store;
