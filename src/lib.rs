//! TierCache - Multi-Tier Intelligent Cache
//!
//! Caches values across an ordered set of storage layers (memory, disk,
//! distributed) with scored eviction, rule-driven invalidation and
//! pattern-driven prefetching.
//!
//! # Architecture
//!
//! ```text
//! Access Log → Pattern Analyzer → Prefetch Engine
//!      ↑                                ↓
//! CacheService ─── TieredStore ─── Layers (rank 0..n)
//!      ↓                                ↑
//! Telemetry  →  Optimizer  ──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Layers, entry store, engines and the service handle
//! - [`config`] - Configuration model, validation and patches
//! - [`error`] - Error types
//! - [`observability`] - Event hook with tracing and Prometheus observers
//! - [`persistence`] - Key/value persistence contract and history log

pub mod cache;
pub mod config;
pub mod error;
pub mod observability;
pub mod persistence;

// Re-export commonly used types
pub use cache::{CacheService, GetOptions, InvalidateOptions, LayerId, SetOptions};
pub use config::{CacheConfiguration, ConfigPatch};
pub use error::{Error, Result};
