//! feide-ldap is a health-checked LDAP client for replicated directories.
//!
//! It uses the following terminology:
//! * An organization (or realm, such as `example.org`) has one directory,
//!   served by one or more replica servers.
//! * A server is one physical LDAP endpoint, reached as a specific bind user.
//!
//! # Usage
//!
//! * The main interface for this crate is [controller::LdapController].
//! * To construct a controller, you must supply a [config::Config] and a
//!   [backend::Connector]. These specify "which servers serve which
//!   organization" and "how to talk to a server", respectively.
//!   [connectors::ldap::LdapConnector] talks LDAPS.
//!
//! # Structure
//!
//! Each server gets one [pool::ConnectionPool], which caps the number of open
//! connections, keeps idle ones for reuse, and tracks whether the server is
//! alive through periodic probes. Each organization gets one
//! [retry::RetryPool] over the pools of its replicas, which sends every search
//! to a randomly chosen live replica and fails over to the others.
//!
//! A server shared by several organizations (with the same bind user) shares
//! a single pool.
//!
//! # Diagnostics
//!
//! Searches emit [tracing] events, and counters, timings and gauges go to a
//! [stats::StatsSink]. [status] holds one-off probes for operators, which
//! bypass the pools entirely.

// Public API
pub mod backend;
pub mod claim;
pub mod config;
pub mod controller;
pub mod health;
pub mod policy;
pub mod pool;
pub mod query;
pub mod retry;
pub mod stats;
pub mod status;

#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;
