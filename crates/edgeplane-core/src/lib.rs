//! Core library for the edge fleet control plane.
//!
//! Contains the plan engine, heartbeat ingestor, enrollment and PKI,
//! CRL manager, offline sweeper, and rate limiter. This crate depends on
//! `edgeplane-storage` for the repository trait and knows nothing about
//! HTTP, TLS termination, or configuration parsing — those are
//! `edgeplane-server`'s job.

pub mod crl;
pub mod enrollment;
pub mod error;
pub mod heartbeat;
pub mod pki;
pub mod plan_engine;
pub mod ratelimit;
pub mod sweeper;
