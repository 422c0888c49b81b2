//! Integration tests for the outbox relay.
//!
//! - `harness.rs`   - Scripted publisher, failing/gated store wrappers, fixtures
//! - `relay.rs`     - Relay cycle outcomes, escalation, batch isolation, loop shutdown
//! - `reapers.rs`   - Outbox and per-consumer inbox reclaim
//! - `retention.rs` - Retention deletes and the reentrancy flag

pub(crate) mod harness;
mod reapers;
mod retention;
