//! The CRDT merge function for a single task replica (C2) and the batch
//! Conflict Resolver (C3).

pub mod merge;
pub mod resolver;

pub use merge::{merge_remote, ConflictReport, FieldConflict, Winner};
pub use resolver::{ConflictResolver, ResolveOutcome, ResolverConfig};
