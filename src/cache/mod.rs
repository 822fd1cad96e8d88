//! Multi-Tier Intelligent Cache
//!
//! Entries live in an ordered set of storage layers (fastest first). Reads
//! probe layers in rank order, writes fan out to the requested layers, and
//! background engines keep the tiers healthy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           CacheService                                    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  get / set / invalidate / analytics / update_configuration / stop        │
//! │         │                                                                 │
//! │  ┌──────┴───────┐   ┌──────────────┐   ┌──────────────┐                  │
//! │  │ TieredStore  │──▶│  Eviction    │   │ Invalidation │ rules + queue    │
//! │  │ arena+layers │   │  Engine      │   │ Engine       │                  │
//! │  └──────┬───────┘   └──────────────┘   └──────────────┘                  │
//! │         │                                                                 │
//! │  ┌──────┴───────┐   ┌──────────────┐   ┌──────────────┐                  │
//! │  │  Pattern     │──▶│  Prefetch    │   │  Telemetry   │──▶ Optimizer     │
//! │  │  Analyzer    │   │  Engine      │   │  (samples)   │                  │
//! │  └──────────────┘   └──────────────┘   └──────────────┘                  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Layers** (`layer.rs`): layer identity, capacity, usage and counters
//! - **Store** (`store.rs`, `arena.rs`, `entry.rs`): entry records and
//!   placement across layers, TTL, checksums, compression
//! - **Eviction** (`eviction.rs`): LRU, LFU, TTL, random and adaptive
//!   victim selection
//! - **Invalidation** (`invalidation.rs`): tags, globs, cascades, rules and
//!   the retrying queue
//! - **Analyzer / Prefetch** (`analyzer.rs`, `prefetch.rs`): access
//!   patterns, predictions and speculative loads
//! - **Telemetry / Optimizer** (`telemetry.rs`, `optimizer.rs`): rolling
//!   analytics and self-tuning
//!
//! # Usage
//!
//! ```rust,ignore
//! use tiercache::cache::{CacheService, InvalidateOptions, SetOptions};
//! use tiercache::config::CacheConfiguration;
//!
//! let cache = CacheService::new(CacheConfiguration::default())?;
//! cache.set("user:1", "alice", SetOptions::new().tag("users"))?;
//! assert!(cache.get("user:1", None)?.is_some());
//! cache.invalidate(["users"], InvalidateOptions::immediate())?;
//! ```

pub mod analyzer;
pub mod arena;
pub mod compression;
pub mod entry;
pub mod eviction;
pub mod invalidation;
pub mod layer;
pub mod optimizer;
pub mod prefetch;
pub mod service;
pub mod store;
pub mod telemetry;

/// Content type recorded when a writer gives none
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub use analyzer::{AccessEvent, AccessPattern, PatternAnalyzer, PatternKind};
pub use arena::{EntryId, EntryStore};
pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager, Compressor};
pub use entry::CacheEntry;
pub use eviction::{AdaptiveScorer, AdaptiveWeights, EvictionEngine, EvictionPolicyKind, EvictionScorer};
pub use invalidation::{
    DrainReport, InvalidateOptions, InvalidationEngine, InvalidationRule, RuleAction, RuleContext,
    TimeWindow, TriggerKind,
};
pub use layer::{CacheLayer, LayerId, LayerRegistry, LayerSnapshot, LayerStatus, StorageKind};
pub use optimizer::{OptimizationAction, OptimizationReport, Optimizer};
pub use prefetch::{
    PlaceholderSource, PrefetchEngine, PrefetchRequest, PrefetchSource, PrefetchStrategy,
    PrefetchTrigger, TargetFilter,
};
pub use service::{CacheService, CacheServiceBuilder, GetOptions, RestoreOutcome};
pub use store::{CacheHit, RemoveOutcome, SetOptions, SetOutcome, TieredStore};
pub use telemetry::{AnalyticsSample, GlobalMetrics, Telemetry};
