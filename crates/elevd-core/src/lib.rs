//! elevd-core - Grant Ledger and Reconciliation Engine
//!
//! This library implements the core of the elevd elevation service: it
//! authorizes requests for temporary membership in a privileged local group,
//! records each grant with a computed expiration in a durable ledger, and
//! periodically reconciles that ledger against live group membership so that
//! rights are revoked on timeout, logoff, service stop, or external removal.
//!
//! # Architecture
//!
//! ```text
//! request ──> GrantController ──> policy (authorize)
//!                 │               timeout (expiration)
//!                 │               GroupControl (OS add/remove)
//!                 v
//!             GrantSet + LedgerStore (atomic persist)
//!                 ^
//!                 │
//! timer ────> Reconciler (diff ledger vs live membership, evict expired)
//! ```
//!
//! # Modules
//!
//! - [`principal`]: Opaque stable security-principal identifier
//! - [`config`]: TOML configuration (policy lists, timeouts, reconciler)
//! - [`policy`]: Allow/deny evaluation with deny precedence
//! - [`timeout`]: Per-principal/per-group timeout override computation
//! - [`grant`]: Grant records, merge semantics, the keyed ledger, and
//!   pluggable persistence via [`grant::store::LedgerStore`]
//! - [`fs_safe`]: Atomic file replacement and bounded JSON reads
//! - [`directory`]: Traits for the OS group/identity/session primitives,
//!   plus an in-memory double for tests
//! - [`controller`]: Grant lifecycle orchestration (grant/revoke/query/drain)
//! - [`reconcile`]: The periodic sweep that repairs ledger/group drift
//! - [`ipc`]: Transport-agnostic request/response types and framing
//!
//! # Concurrency Model
//!
//! All ledger mutation goes through a single mutex inside
//! [`controller::GrantController`]: read-modify-persist is one critical
//! section, so concurrent grant requests can never race on the persisted
//! file. External group calls are synchronous; async callers should bridge
//! via `tokio::task::spawn_blocking`.

pub mod config;
pub mod controller;
pub mod directory;
pub mod fs_safe;
pub mod grant;
pub mod ipc;
pub mod policy;
pub mod principal;
pub mod reconcile;
pub mod timeout;

pub use config::{ElevdConfig, PolicyConfig, TimeoutConfig};
pub use controller::{GrantController, GrantRequestError, RevokeReason};
pub use directory::{GroupControl, IdentityDirectory, MemoryDirectory, SessionDirectory};
pub use grant::store::{JsonLedgerStore, LedgerStore, MemoryLedgerStore};
pub use grant::{Grant, GrantSet};
pub use principal::{Principal, SessionId};
pub use reconcile::{Reconciler, SweepReport};
