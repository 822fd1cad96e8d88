//! TierCache Integration Tests
//!
//! Exercises the public service surface:
//! - Tiered placement, capacity and eviction
//! - TTL, invalidation and rules
//! - Pattern analysis feeding prefetch
//! - Configuration lifecycle, persistence and shutdown

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use tiercache::cache::layer::StorageKind;
use tiercache::cache::{CacheService, GetOptions, InvalidateOptions, LayerId, LayerStatus, SetOptions};
use tiercache::config::{CacheConfiguration, ConfigPatch, LayerConfig, LayerPatch};
use tiercache::observability::{events, RecordingObserver};
use tiercache::Error;

fn two_layers(l1_bytes: u64) -> CacheConfiguration {
    CacheConfiguration::with_layers(vec![
        LayerConfig::new("L1", 0, StorageKind::Memory, l1_bytes),
        LayerConfig::new("L2", 1, StorageKind::Disk, 1_000_000),
    ])
}

fn with_observer(config: CacheConfiguration) -> (Arc<CacheService>, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::new());
    let service = CacheService::builder(config)
        .observer(observer.clone())
        .build()
        .unwrap();
    (service, observer)
}

fn l1() -> LayerId {
    LayerId::from("L1")
}

// =============================================================================
// Tiered Storage Tests
// =============================================================================

mod storage_tests {
    use super::*;

    #[test]
    fn test_full_layer_evicts_lowest_scored_entry() {
        let (service, observer) = with_observer(two_layers(1000));
        for i in 0..5 {
            let key = format!("k{}", i);
            service
                .set(&key, vec![0u8; 200], SetOptions::new().layers([l1()]))
                .unwrap();
        }
        // k0 is never read, so it scores lowest
        for i in 1..5 {
            for _ in 0..3 {
                service.get(&format!("k{}", i), None).unwrap();
            }
        }

        let outcome = service
            .set("k5", vec![0u8; 200], SetOptions::new().layers([l1()]))
            .unwrap();
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].1, "k0");
        assert_eq!(observer.count(events::ENTRY_EVICTED), 1);

        let layer = service
            .layers()
            .into_iter()
            .find(|l| l.id == l1())
            .unwrap();
        assert_eq!(layer.usage.bytes, 1000);
        assert_eq!(layer.usage.entries, 5);
        assert!(service.get("k0", None).unwrap().is_none());
        assert!(service.get("k5", None).unwrap().is_some());
    }

    #[test]
    fn test_read_falls_through_to_slower_layer() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service
            .set("deep", "value", SetOptions::new().layers(["L2"]))
            .unwrap();

        let hit = service.get_with("deep", &GetOptions::new()).unwrap().unwrap();
        assert_eq!(hit.layer, LayerId::from("L2"));
        assert_eq!(hit.value, Bytes::from("value"));
    }

    #[test]
    fn test_overwrite_bumps_version() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        let first = service.set("k", "one", SetOptions::new()).unwrap();
        let second = service.set("k", "two", SetOptions::new()).unwrap();
        assert!(second.version > first.version);
        assert_eq!(service.get("k", None).unwrap(), Some(Bytes::from("two")));
    }

    #[test]
    fn test_offline_layer_is_skipped_and_explicit_read_fails() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set_layer_status(&l1(), LayerStatus::Offline).unwrap();

        let outcome = service.set("k", "v", SetOptions::new()).unwrap();
        assert_eq!(outcome.layers, vec![LayerId::from("L2")]);

        let hit = service.get_with("k", &GetOptions::new()).unwrap().unwrap();
        assert_eq!(hit.layer, LayerId::from("L2"));

        assert_matches!(
            service.get("k", Some(&[l1()])),
            Err(Error::LayerUnavailable { .. })
        );
        assert_matches!(
            service.get("k", Some(&[LayerId::from("L9")])),
            Err(Error::UnknownLayer(_))
        );
    }

    #[test]
    fn test_entry_larger_than_layer_is_skipped() {
        let service = CacheService::new(two_layers(100)).unwrap();
        let outcome = service.set("big", vec![1u8; 500], SetOptions::new()).unwrap();
        assert_eq!(outcome.layers, vec![LayerId::from("L2")]);
        assert!(outcome.skipped.contains(&l1()));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set("k", "v", SetOptions::new().ttl_ms(50)).unwrap();
        assert!(service.get("k", None).unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(service.get("k", None).unwrap().is_none());
        assert_eq!(service.get_global_metrics().entries, 0);
    }
}

// =============================================================================
// Invalidation Tests
// =============================================================================

mod invalidation_tests {
    use super::*;
    use tiercache::cache::{InvalidationRule, RuleContext, TriggerKind};

    #[test]
    fn test_tag_and_glob_invalidation() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set("user:1", "a", SetOptions::new().tag("users")).unwrap();
        service.set("user:2", "b", SetOptions::new().tag("users")).unwrap();
        service.set("post:1", "c", SetOptions::new()).unwrap();

        assert_eq!(service.invalidate(["users"], InvalidateOptions::immediate()).unwrap(), 2);
        assert_eq!(service.invalidate(["post:*"], InvalidateOptions::immediate()).unwrap(), 1);
        assert_eq!(service.get_global_metrics().entries, 0);
    }

    #[test]
    fn test_invalidation_is_idempotent() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set("k", "v", SetOptions::new()).unwrap();
        assert_eq!(service.invalidate(["k"], InvalidateOptions::immediate()).unwrap(), 1);
        assert_eq!(service.invalidate(["k"], InvalidateOptions::immediate()).unwrap(), 0);
    }

    #[test]
    fn test_cascade_is_single_hop() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set("c", "3", SetOptions::new()).unwrap();
        service.set("b", "2", SetOptions::new()).unwrap();
        service
            .set("a", "1", SetOptions::new().depends_on("b").depends_on("c"))
            .unwrap();
        service.set("x", "0", SetOptions::new().depends_on("a")).unwrap();

        let affected = service
            .invalidate(["b"], InvalidateOptions::immediate().cascade())
            .unwrap();
        assert_eq!(affected, 2);
        assert!(service.get("a", None).unwrap().is_none());
        assert!(service.get("b", None).unwrap().is_none());
        assert!(service.get("c", None).unwrap().is_some());
        assert!(service.get("x", None).unwrap().is_some());
    }

    #[test]
    fn test_layer_scoped_invalidation_keeps_other_copies() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set("k", "v", SetOptions::new()).unwrap();
        service
            .invalidate(["k"], InvalidateOptions::immediate().layers([l1()]))
            .unwrap();

        let hit = service.get_with("k", &GetOptions::new()).unwrap().unwrap();
        assert_eq!(hit.layer, LayerId::from("L2"));
    }

    #[test]
    fn test_queued_invalidation_applies_on_drain() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set("k", "v", SetOptions::new()).unwrap();
        assert_eq!(service.invalidate(["k"], InvalidateOptions::queued()).unwrap(), 0);
        assert!(service.get("k", None).unwrap().is_some());

        let report = service.drain_invalidations();
        assert_eq!(report.processed, 1);
        assert!(service.get("k", None).unwrap().is_none());
    }

    #[test]
    fn test_event_rule() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set("price:1", "9.99", SetOptions::new()).unwrap();
        service.set("stock:1", "3", SetOptions::new()).unwrap();

        let mut rule = InvalidationRule::new("prices", TriggerKind::EventBased).on_event("price_changed");
        rule.conditions.patterns.push("price:*".to_string());
        service.add_rule(rule).unwrap();

        assert_eq!(service.handle_event("stock_changed"), 0);
        assert_eq!(service.handle_event("price_changed"), 1);
        assert!(service.get("stock:1", None).unwrap().is_some());
        assert_eq!(service.apply_rule("missing", &RuleContext::now()), 0);
    }
}

// =============================================================================
// Prediction Tests
// =============================================================================

mod prediction_tests {
    use super::*;
    use async_trait::async_trait;
    use tiercache::cache::{PrefetchRequest, PrefetchSource};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_transitions_drive_prefetch_and_credit() {
        let (service, observer) = with_observer(two_layers(10_000));
        for user in ["u1", "u2", "u3"] {
            let options = GetOptions::new().actor(user);
            service.get_with("home", &options).unwrap();
            service.get_with("feed", &options).unwrap();
        }

        assert!(service.analyze() >= 1);
        assert_eq!(service.run_prefetch("next-key").await.unwrap(), 1);
        assert_eq!(observer.count(events::PREFETCH_COMPLETED), 1);

        let hit = service.get_with("feed", &GetOptions::new()).unwrap().unwrap();
        assert_eq!(hit.layer, l1());
        assert_eq!(hit.prefetch_credit.as_deref(), Some("next-key"));

        // Already cached: nothing more to fetch
        assert_eq!(service.run_prefetch("next-key").await.unwrap(), 0);
    }

    /// Holds every fetch until the test releases it
    struct GatedSource {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PrefetchSource for GatedSource {
        async fn fetch(&self, _request: &PrefetchRequest) -> tiercache::Result<Option<Bytes>> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(Some(Bytes::from_static(b"placeholder")))
        }
    }

    #[tokio::test]
    async fn test_write_during_prefetch_is_not_overwritten() {
        let source = Arc::new(GatedSource {
            started: Notify::new(),
            release: Notify::new(),
        });
        let observer = Arc::new(RecordingObserver::new());
        let service = CacheService::builder(two_layers(10_000))
            .observer(observer.clone())
            .prefetch_source(source.clone())
            .build()
            .unwrap();
        for user in ["u1", "u2", "u3"] {
            let options = GetOptions::new().actor(user);
            service.get_with("home", &options).unwrap();
            service.get_with("feed", &options).unwrap();
        }
        assert!(service.analyze() >= 1);

        let prefetching = {
            let service = service.clone();
            tokio::spawn(async move { service.run_prefetch("next-key").await })
        };
        source.started.notified().await;
        service.set("feed", "REAL", SetOptions::new()).unwrap();
        source.release.notify_one();
        assert_eq!(prefetching.await.unwrap().unwrap(), 1);

        assert_eq!(service.get("feed", None).unwrap().unwrap().as_ref(), b"REAL");
        let l2 = service.get("feed", Some(&[LayerId::from("L2")])).unwrap();
        assert_eq!(l2.unwrap().as_ref(), b"REAL");
        assert_eq!(observer.count(events::PREFETCH_COMPLETED), 0);
    }

    #[tokio::test]
    async fn test_unknown_strategy() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        assert!(service.run_prefetch("nope").await.is_err());
    }

    #[test]
    fn test_analytics_after_sampling() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.set("k", "v", SetOptions::new()).unwrap();
        service.get("k", None).unwrap();
        service.get("missing", None).unwrap();
        service.sample();

        let samples = service.get_analytics(Some(&l1()), None).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].requests.hits, 1);

        let metrics = service.get_global_metrics();
        assert_eq!(metrics.layers, 2);
        assert_eq!(metrics.entries, 1);
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

mod lifecycle_tests {
    use super::*;
    use tiercache::persistence::{InMemoryPersistence, PersistenceStore, CONFIGURATION_KEY};

    #[tokio::test]
    async fn test_invalid_patch_is_rejected_whole() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        let before = service.configuration();

        let mut patch = ConfigPatch::default();
        patch.layers.insert(
            "L1".into(),
            LayerPatch {
                max_size_bytes: Some(-1),
                ..Default::default()
            },
        );
        patch.global.compression_enabled = Some(false);

        assert_matches!(
            service.update_configuration(&patch).await,
            Err(Error::InvalidConfiguration(_))
        );
        assert_eq!(service.configuration(), before);
    }

    #[tokio::test]
    async fn test_disabling_layer_takes_it_offline() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        let mut patch = ConfigPatch::default();
        patch.layers.insert(
            "L1".into(),
            LayerPatch {
                enabled: Some(false),
                ..Default::default()
            },
        );
        service.update_configuration(&patch).await.unwrap();

        let outcome = service.set("k", "v", SetOptions::new()).unwrap();
        assert_eq!(outcome.layers, vec![LayerId::from("L2")]);
    }

    #[tokio::test]
    async fn test_configuration_survives_restart() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let first = CacheService::builder(two_layers(10_000))
            .persistence(persistence.clone())
            .build()
            .unwrap();
        let mut patch = ConfigPatch::default();
        patch.prefetching.max_concurrent = Some(9);
        first.update_configuration(&patch).await.unwrap();
        assert!(persistence.load(CONFIGURATION_KEY).await.unwrap().is_some());
        first.stop().await;

        let second = CacheService::builder(two_layers(10_000))
            .persistence(persistence)
            .build()
            .unwrap();
        assert!(second.restore().await.configuration);
        assert_eq!(second.configuration().prefetching.max_concurrent, 9);
    }

    #[tokio::test]
    async fn test_shrinking_a_layer_evicts_down_to_the_new_size() {
        let (service, observer) = with_observer(two_layers(10_000));
        for i in 0..5 {
            service
                .set(&format!("k{}", i), vec![1u8; 2000], SetOptions::new().layers([l1()]).compress(false))
                .unwrap();
        }

        let mut patch = ConfigPatch::default();
        patch.layers.insert(
            "L1".into(),
            LayerPatch {
                max_size_bytes: Some(2048),
                ..Default::default()
            },
        );
        service.update_configuration(&patch).await.unwrap();

        let layer = service.layers().into_iter().find(|l| l.id == l1()).unwrap();
        assert_eq!(layer.capacity.max_size_bytes, 2048);
        assert!(layer.usage.bytes <= 2048);
        assert_eq!(observer.count(events::ENTRY_EVICTED), 4);
        assert_eq!(service.get_global_metrics().entries, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let service = CacheService::new(two_layers(10_000)).unwrap();
        service.start();
        service.stop().await;
        service.stop().await;
        assert!(service.is_stopped());

        // Foreground calls still work after stop
        service.set("k", "v", SetOptions::new()).unwrap();
        assert!(service.get("k", None).unwrap().is_some());
    }
}

// =============================================================================
// Property Tests
// =============================================================================

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_layer_usage_never_exceeds_capacity(sizes in prop::collection::vec(1usize..400, 1..60)) {
            let service = CacheService::new(two_layers(1000)).unwrap();
            for (i, size) in sizes.iter().enumerate() {
                service
                    .set(&format!("k{}", i % 17), vec![7u8; *size], SetOptions::new().layers([l1()]))
                    .unwrap();

                let layer = service.layers().into_iter().find(|l| l.id == l1()).unwrap();
                prop_assert!(layer.usage.bytes <= layer.capacity.max_size_bytes);
            }
        }

        #[test]
        fn prop_layer_usage_fits_after_shrink(
            sizes in prop::collection::vec(1usize..400, 1..40),
            shrunk in 0i64..1000,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let service = CacheService::new(two_layers(1000)).unwrap();
            for (i, size) in sizes.iter().enumerate() {
                service
                    .set(&format!("k{}", i), vec![7u8; *size], SetOptions::new().layers([l1()]))
                    .unwrap();
            }

            let mut patch = ConfigPatch::default();
            patch.layers.insert(
                "L1".into(),
                LayerPatch {
                    max_size_bytes: Some(shrunk),
                    ..Default::default()
                },
            );
            let applied = runtime.block_on(service.update_configuration(&patch));
            if applied.is_ok() {
                let layer = service.layers().into_iter().find(|l| l.id == l1()).unwrap();
                prop_assert!(layer.usage.bytes <= layer.capacity.max_size_bytes);
            }
        }
    }
}
