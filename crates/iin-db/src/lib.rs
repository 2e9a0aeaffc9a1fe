//! SQLite storage for IIN agent membership records.
//!
//! Holds the local security domain's own membership and the jointly attested
//! memberships of foreign domains recorded at the end of a sync run. Schema
//! is managed by embedded, versioned migrations; connections come from an
//! `r2d2` pool configured for WAL mode.

mod membership;
mod migrations;
mod pool;

pub use membership::{
    get_foreign_membership, get_local_membership, list_foreign_memberships, membership_history,
    record_foreign_membership, store_local_membership, HistoryEntry, MembershipDbError,
    RecordedMembership, StoredForeignMembership,
};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
