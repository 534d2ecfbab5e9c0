//! Cross-process persona reservation.
//!
//! Several assistant sessions on one machine share a fixed catalog of
//! personas. A persona is held by at most one session at a time; sessions
//! reserve, renew and release them through a [`PersonaRegistry`] backed by a
//! [`RegistryStore`].
//!
//! # Design decisions
//!
//! - Locking is best-effort and single-machine only. The file store relies
//!   on revisioned compare-and-swap, a sidecar lock file and atomic rename.
//! - Expired leases are reclaimed lazily by the next reservation.
//! - Nothing here is global: callers construct the store, registry and
//!   session id and pass them where they are needed.

pub mod error;
pub mod registry;
pub mod session;
pub mod store;


pub use error::{PersonaError, StoreError};
pub use registry::{
    Availability, PersonaRegistry, RegistryEntry, RegistryTable, Reservation, SessionLease,
    DEFAULT_LEASE_TIMEOUT, REGISTRY_KEY,
};
pub use session::{derive_session_id, session_from_env};
pub use store::{FileRegistryStore, MemoryRegistryStore, RegistryStore, Versioned};
