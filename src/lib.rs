//! chaindex — a subset hash index for log-structured key/value stores.
//!
//! The index answers predicate queries over a primary KV store: "every
//! record whose current value maps, under predicate P, to key k". Users
//! register *groups* of predicates (`value -> optional key`); each group
//! owns a log-structured secondary store whose records carry one
//! [`KeyPointer`](store::KeyPointer) per predicate, so a single inserted
//! record participates in N independent hash chains at once.
//!
//! # Theoretical Basis
//!
//! - **FASTER**: Chandramouli et al., "FASTER: A Concurrent Key-Value Store
//!   with In-Place Updates", SIGMOD 2018. The hybrid-log layout, epoch-style
//!   version/phase machinery, and hash-chain CAS discipline follow this
//!   design.
//! - Secondary-index maintenance over LSM/log-structured stores is
//!   surveyed in Luo & Carey, "LSM-based Storage Techniques", VLDB J. 2020.
//!
//! # Concurrency
//!
//! Mutators and readers share each store; sessions are single-owner and
//! synchronize only through hash-table CAS and the store's version word.
//! Chains are linked in strictly decreasing address order (the downward
//! invariant), which keeps traversal acyclic under every interleaving.
//!
//! # Safety
//! Log records are accessed through raw pointers into page memory; all
//! unsafe blocks are documented with `// SAFETY:` comments and page memory
//! is never released while shared access is possible.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod group;
pub mod hash;
pub mod manager;
pub mod primary;
pub mod query;
pub mod session;
pub mod store;

pub use addr::{Address, RecordId};
pub use checkpoint::{CheckpointKind, CheckpointManifest, CheckpointToken};
pub use config::{LogSettings, RegistrationSettings};
pub use device::{FileDevice, InMemoryDevice, LogDevice, SharedDevice};
pub use error::{ChaindexError, ChaindexErrorKind, Result, Status};
pub use group::{GroupId, PredicateDef, PredicateHandle, UpdateOp};
pub use hash::{IndexKey, KeyComparer, Xxh64Comparer};
pub use manager::IndexManager;
pub use primary::{LivenessSession, LogPrimary, PrimaryStore};
pub use query::{CancellationToken, QueryMatch, QueryOptions, QueryResults};
pub use session::IndexSession;
pub use store::StatsSnapshot;
