//! # waypost-db: Local Durable Store
//!
//! Everything the tracker must remember across process death: the zone
//! cache, membership and candidate state, the offline event queues, and the
//! heartbeat/shutdown record.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Waypost Data Flow                                │
//! │                                                                         │
//! │  PresenceTracker / SyncEngine / ShutdownHandler (waypost-sync)         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     waypost-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │    │  (embedded)  │  │   │
//! │  │   │               │    │ ZoneCache      │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ Membership     │    │ 0001_initial │  │   │
//! │  │   │ WAL           │    │ EventQueue     │    │              │  │   │
//! │  │   │               │    │ ProviderEvents │    │              │  │   │
//! │  │   │               │    │ Lifecycle      │    │              │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (waypost.db)                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use waypost_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("waypost.db")).await?;
//! let zones = db.zone_cache().load_all().await?;
//! let state = db.membership().load_state().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::event_queue::{EventQueueRepository, QueuedEvent};
pub use repository::lifecycle::LifecycleRepository;
pub use repository::membership::MembershipRepository;
pub use repository::provider_events::{ProviderEventRepository, QueuedProviderEvent};
pub use repository::zone_cache::ZoneCacheRepository;
