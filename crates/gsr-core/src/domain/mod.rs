//! Domain entities for the GSR orchestrator.
//!
//! This module contains pure business logic with no infrastructure
//! dependencies: no sockets, no async runtime, no file system.  Outer layers
//! (the session manager, the connection server) depend on these types, never
//! the other way round, so everything here can be unit-tested in isolation.

/// Recording session lifecycle, samples and sync marks.
///
/// See [`session::Session`] for the main type.
pub mod session;
