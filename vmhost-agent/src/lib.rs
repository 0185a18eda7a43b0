//! Inception VM host agent
//!
//! Node configuration and envelope routing for the middle tier. The
//! `vmhost-agent` binary wires them to the license gate, one connection
//! manager per KVM and the admin-facing QUIC server.

pub mod config;
pub mod router;
