//! Test doubles for the exchange.
//!
//! - [`MockOracle`] plays the oracle service against any [`StoreBackend`],
//!   answering request rows with deterministic results.
//! - [`TestCluster`] runs a group of ranks, in-process or over loopback TCP,
//!   against one in-memory store.
//!
//! # Example
//!
//! ```rust,no_run
//! use glue_exchange::config::GlueConfig;
//! use glue_exchange::kinds::{LbmRequest, LbmToOneDmd};
//! use glue_exchange::testing::TestCluster;
//!
//! # async fn demo() -> glue_exchange::Result<()> {
//! let cluster = TestCluster::new(3, GlueConfig::default());
//! let reports = cluster
//!     .run::<LbmToOneDmd, _>(|_rank, _round| vec![LbmRequest::default(); 4])
//!     .await?;
//! assert_eq!(reports.len(), 3);
//! cluster.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! [`StoreBackend`]: crate::store::StoreBackend

mod cluster;
mod oracle;
mod utils;


pub use cluster::{RankOutcome, RankReport, TestCluster};
pub use oracle::{oracle_answer, oracle_provenance, MockOracle, OracleOptions, OracleReport};
pub use utils::init_tracing;
