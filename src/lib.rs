//! Request/response exchange between parallel simulation ranks and an
//! external computation oracle.
//!
//! Simulation ranks submit typed physics requests (transport coefficients,
//! adsorption) as rows in a shared store; an oracle process reads them and
//! writes result rows back. This crate implements the rank side:
//!
//! - **Single and batch requests** ([`Exchange`]): write request rows, poll
//!   the store with backoff until every result is observed.
//! - **Collective requests** ([`GlueSession`]): every rank of a group submits
//!   together, and rank 0 brokers the whole group's traffic to the store in
//!   bounded chunks.
//!
//! # Example
//!
//! ```rust,no_run
//! use glue_exchange::kinds::{Bgk, BgkRequest};
//! use glue_exchange::store::SqliteStore;
//! use glue_exchange::{Exchange, GlueConfig, OperatingMode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GlueConfig::new("glue.db");
//!     let store = SqliteStore::open(&config.store).await?;
//!     let exchange = Exchange::new(Arc::new(store), &config);
//!
//!     let request = BgkRequest {
//!         temperature: 100.0,
//!         density: [1.0, 0.0, 0.0, 0.0],
//!         charges: [1.0, 0.0, 0.0, 0.0],
//!     };
//!     if let Some(response) = exchange
//!         .request_single::<Bgk>(&request, 0, "run-1", OperatingMode::Default)
//!         .await?
//!     {
//!         println!("viscosity {} via {}", response.viscosity, response.provenance);
//!     }
//!
//!     exchange.stop_service::<Bgk>(0, "run-1").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   GlueSession (collective, one per rank)     │
//! │   gather counts → chunks → scatter results   │
//! └──────────────────────────────────────────────┘
//!          │ group::Communicator        │ broker only
//!          ▼                            ▼
//! ┌─────────────────┐   ┌────────────────────────────────┐
//! │ LocalGroup /    │   │ Exchange                       │
//! │ TcpGroup        │   │ ids · kinds · poll · reconcile │
//! └─────────────────┘   └────────────────────────────────┘
//!                                       │
//!                                       ▼
//!                       ┌────────────────────────────────┐
//!                       │ StoreClient (retry on busy)    │
//!                       │ SqliteStore / MemoryStore      │
//!                       └────────────────────────────────┘
//! ```
//!
//! # Delivery
//!
//! - Ids are unique per allocation scope and never reused.
//! - The first result observed for an id wins; later duplicates are dropped.
//! - Waits are unbounded unless [`PollConfig::deadline`] is set, in which case
//!   they fail with [`Error::Timeout`].

pub mod collective;
pub mod config;
pub mod error;
pub mod exchange;
pub mod group;
pub mod kinds;
pub mod metrics;
pub mod store;
pub mod testing;
pub mod types;

pub use collective::{ChunkPlan, GlueSession, BROKER_RANK};
pub use config::{CollectiveConfig, FatalPolicy, GlueConfig, PollConfig, StoreConfig};
pub use error::{Error, NetworkError, ProtocolError, Result, StoreError};
pub use exchange::{AsyncResultTable, Exchange, IdScope, Reconciler, RequestIdAllocator};
pub use group::{Communicator, LocalGroup, TcpGroup, Transfer};
pub use kinds::{Kind, KindRegistry};
pub use metrics::{ExchangeMetrics, MetricsSnapshot};
pub use store::{MemoryStore, SqliteStore, StoreBackend, StoreClient};
pub use types::{KindTag, OperatingMode, Rank, RequestId, ResultRow, RequestRow};
