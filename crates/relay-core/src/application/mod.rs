/// Request context, retry policy and engine configuration
pub mod context;

/// The engine loop
pub mod engine;

/// Task graphs compiled from definitions
pub mod graph;

/// Definition cache and the inbound resume surface
pub mod process_manager;
