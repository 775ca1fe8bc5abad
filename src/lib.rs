//! This crate implements a distributed, user-space parallel filesystem for
//! ephemeral HPC scratch storage.
//!
//! A job spans a set of nodes; every node runs a `scratchfsd` daemon and the
//! application links the client half of this library (usually behind a
//! syscall-interception shim, which is not part of this crate). Each file is
//! split into fixed-size chunks that are spread deterministically over the
//! daemons, while per-path metadata lives as a single record in an embedded
//! ordered key/value store on exactly one daemon.
//!
//! The crate is organized around that split:
//!
//! * [`chunk_calc`] - pure offset/chunk arithmetic shared by both halves.
//! * [`distributor`] - deterministic `(path, chunk)` to host placement.
//! * [`metadata`] - the serializable per-path record.
//! * [`rpc`] - wire messages, framing and the client-side channel.
//! * [`daemon`] - KV engine with merge operands, chunk storage, the I/O
//!   pool and the RPC handlers.
//! * [`client`] - open-file table, per-operation fan-out and the
//!   POSIX-like operation layer.
//!
//! Strict POSIX semantics are deliberately relaxed (no global timestamps by
//! default, no link counts, no cross-node directory locking) in exchange
//! for throughput. All persisted state is expected to be wiped between
//! jobs.

pub mod chunk_calc;
pub mod client;
pub mod config;
pub mod daemon;
pub mod distributor;
pub mod error;
pub mod hosts;
pub mod metadata;
pub mod rpc;

pub use error::{FsError, FsResult};
