//! Inception KVM agent
//!
//! The terminal tier's link to its local daemon. The `kvm-agent` binary
//! serves it to VM hosts over QUIC.

pub mod daemon;
