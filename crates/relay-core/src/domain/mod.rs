/// Process definitions and the element graph document
pub mod definition;

/// Process instances and per-task state
pub mod instance;

/// Lanes and participant resolution
pub mod participant;

/// Ports to external collaborators
pub mod ports;

/// Task output references
pub mod reference;

/// Repository interfaces
pub mod repository;
