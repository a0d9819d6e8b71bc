//! Smart Traffic Library
//!
//! A multi-agent city traffic simulation: dynamic edge costs, rerouting
//! vehicles, emergency priority and traffic light arbitration.

pub mod simulation;
