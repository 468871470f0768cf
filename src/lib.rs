//! VRF fulfillment oracle.
//!
//! Watches the coordinator for randomness requests and fulfills each one at
//! most once per request id, across restarts and reorgs. Every gas lane
//! (verification key plus signing key) runs its own listener, pipeline and
//! tracker. The attempt store is the source of truth the lanes are rebuilt
//! from at startup.

pub mod batch;
pub mod config;
pub mod error;
pub mod gas;
pub mod lane;
pub mod ledger;
pub mod listener;
pub mod logs;
pub mod metrics;
pub mod pipeline;
pub mod proof;
pub mod reconciler;
pub mod rpc;
pub mod store;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
