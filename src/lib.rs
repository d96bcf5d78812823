//! Zero-downtime, reversible schema migrations for PostgreSQL.
//!
//! `oxide-roll` applies declarative migrations to a live database in two
//! explicit steps, so two application versions — one expecting the old
//! schema, one the new — can read and write concurrently during the
//! transition:
//!
//! - **Start** performs only non-blocking changes: new columns and tables
//!   under transient names, NOT VALID constraints, concurrent indexes and a
//!   pair of up/down triggers that keep both column shapes reconciled. A
//!   batched backfill fills duplicated columns without long-lived locks,
//!   and a fresh schema of per-version views publishes the new shape.
//! - **Complete** promotes the new shape: old columns dropped, transient
//!   names renamed into place, deferred constraints validated — atomically.
//! - **Rollback** removes the new shape instead, leaving the database as it
//!   was.
//!
//! # Architecture
//!
//! - **Operations** - The closed catalog of schema changes (`create_table`,
//!   `alter_column`, `create_index`, ...), each implementing the four-phase
//!   life cycle.
//! - **Schema** - In-memory snapshots mapping visible names to the physical
//!   columns backing them.
//! - **Backfill** - Primary-key-ordered, batch-bounded self-updates that
//!   fire the up triggers for existing rows.
//! - **State** - An engine-owned schema inside the target database holding
//!   migration history and derived snapshots.
//! - **Roll** - The controller orchestrating the three phases under a
//!   per-schema advisory lock.
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_roll::prelude::*;
//!
//! let roll = Roll::connect("postgres://localhost/app", "public", "pgroll").await?;
//! roll.init().await?;
//!
//! let migration = read_migration_file(Path::new("migrations/01_add_email.json"))?;
//! roll.start(&migration).await?;
//! // ... both application versions run against their own views ...
//! roll.complete().await?;
//! ```

pub mod backfill;
pub mod error;
pub mod migration;
pub mod operations;
pub mod roll;
pub mod schema;
pub mod sql;
pub mod state;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backfill::Config as BackfillConfig;
    pub use crate::error::{Result, RollError};
    pub use crate::migration::{read_migration, read_migration_file, Format, Migration};
    pub use crate::operations::Operation;
    pub use crate::roll::{Roll, DEFAULT_SCHEMA};
    pub use crate::schema::{Column, Schema, Table};
    pub use crate::state::{State, DEFAULT_STATE_SCHEMA};
}
