//! # volshard
//!
//! Client-side horizontal sharding over independent SQL databases
//! ("volumes"). Each shard is a plain database reached through the
//! [`ShardConnection`] trait; this crate adds the layer that makes
//! them behave like one logical store:
//!
//! - **Identifiers** ([`id`]): 32-character ids that embed the owning
//!   shard, so routing a record never needs a lookup table.
//! - **Routing** ([`router`]): capacity-aware write targeting and
//!   id-based read routing over a registry of shard bindings.
//! - **Queries** ([`query`]): fan-out with global sort/pagination,
//!   recombined aggregates, in-memory joins, best-effort distributed
//!   transactions and lazy batch streaming.
//! - **Uniqueness** ([`dedup`]): constraints enforced over the union
//!   of all shards, plus duplicate detection and cleanup.
//! - **Consistency** ([`consistency`]): audits of id ownership and
//!   placement, with best-effort repair.
//! - **Migration** ([`migration`]): batch import of a monolithic
//!   source database into the shard fleet.
//!
//! ```no_run
//! use std::sync::Arc;
//! use volshard::{IdCodec, RouterConfig, ShardRouter, CrossShardQuery};
//! use volshard::router::ShardBinding;
//!
//! # fn connect(_name: &str) -> Arc<dyn volshard::ShardConnection> { unimplemented!() }
//! # fn main() -> volshard::Result<()> {
//! let codec = Arc::new(IdCodec::new());
//! let config = RouterConfig::new(vec![
//!     ShardBinding::new("DB_VOL_001_abc123", connect("DB_VOL_001_abc123")),
//!     ShardBinding::new("DB_VOL_002_def456", connect("DB_VOL_002_def456")),
//! ]);
//! let router = Arc::new(ShardRouter::new(config, codec)?);
//! let query = CrossShardQuery::new(router);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod consistency;
pub mod core;
pub mod dedup;
pub mod id;
pub mod migration;
pub mod query;
pub mod router;

pub use connection::{RunMeta, ShardConnection, Statement};
pub use consistency::{ConsistencyConfig, ConsistencyService};
pub use crate::core::{Params, Result, Row, ShardError};
pub use dedup::{DeduplicationService, KeepStrategy, UniqueCheck};
pub use id::{DecodedId, IdCodec, IdRequest};
pub use migration::{MigrationConfig, ShardMigration};
pub use query::{
    CrossShardQuery, GlobalQueryResult, QueryOptions, ShardStatement, SortDirection,
};
pub use router::{RouterConfig, ShardRouter};
