//! `gpupool` is the core library of the Deckhouse GPU control plane.
//!
//! It reconciles GPU pools (named collections of physical GPUs or MIG
//! partitions) against the fleet inventory, marks nodes so the NVIDIA
//! data-plane workloads land on them, renders those workloads, and gates
//! workload pods through a pair of admission webhooks.
//!
//! The crate is split along the control flow: [`controller`] wires watches
//! into a [`queue`] of pool keys, [`reconcile`] drives the handler chain for
//! one pool at a time, and [`admission`] serves the webhook endpoints. The
//! remaining modules are the pure building blocks the handlers share.

pub mod admission;
pub mod api;
pub mod backoff;
pub mod capacity;
pub mod client;
pub mod config;
pub mod controller;
pub mod matcher;
pub mod moduleconfig;
pub mod pool;
pub mod queue;
pub mod reconcile;
pub mod selector;
