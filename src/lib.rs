//! # pairwatch
//!
//! Real-time detection and liquidity classification of newly created DEX
//! trading pairs on BNB Smart Chain. The crate watches the PancakeSwap V2
//! factory for `PairCreated` events, values each pair's reserves in USD and
//! sorts it into an alert tier, staying operational when individual upstreams
//! (RPC endpoints, price APIs, the subgraph, Redis) degrade or disappear.
//!
//! ## Architecture
//!
//! ### Detection Layer
//! Watches the factory over a websocket event stream when available and falls
//! back one-way to HTTP log polling; a periodic backfill sweep against the
//! factory's pair count catches anything missed in between. Pairs are
//! deduplicated in memory for the process lifetime.
//!
//! ### Valuation Layer
//! Pairs are valued from their on-chain reserves: known base tokens (wrapped
//! native, major stables) anchor the USD math, with a one-sided doubling rule
//! when only one side is known. Prices come from a cascading provider list
//! behind a TTL cache; trading activity from the exchange subgraph with a
//! DEX-aggregator fallback.
//!
//! ### Resilience Layer
//! Every chain read goes through a multi-endpoint RPC pool with health
//! tracking and sticky-cursor failover. Caches demote from Redis to an
//! in-process map, price lookups degrade to stale values and finally to a
//! sentinel, and a total volume outage yields an explicit "unknown" sample
//! instead of an error.

// Detection
/// Factory event detection (push, poll and backfill)
pub mod detector;
/// Notifier boundary for classified pairs
pub mod notifier;

// Valuation
/// Liquidity tier classification
pub mod classifier;
/// On-chain pair state reads
pub mod chain_reader;
/// USD price resolution with cascade and fallbacks
pub mod price_oracle;
/// Trading activity sampling
pub mod volume_analyzer;
/// Known base-token registry
pub mod token_registry;

// Resilience & Infrastructure
/// RPC endpoint pool with health-tracked failover
pub mod rpc_pool;
/// Provider cascade with per-source rate gates
pub mod cascade;
/// Price cache (Redis with in-process fallback)
pub mod price_cache;
/// Bounded exponential-backoff retries
pub mod retry;

// Periphery
/// Block-explorer client (contract verification)
pub mod explorer;
/// Best-effort token safety checks
pub mod safety;

// Contracts (Read-Only ABIs)
/// Smart contract ABIs for the factory, pairs and tokens
pub mod contracts;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use classifier::{ClassifyResult, LiquidityClassifier, LiquidityTier, PairClassification};
pub use detector::PairEventDetector;
pub use price_oracle::PriceOracle;
pub use rpc_pool::RpcEndpointPool;
pub use settings::Settings;
pub use volume_analyzer::VolumeAnalyzer;
