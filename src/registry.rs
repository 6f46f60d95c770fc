use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::errors::{ChainError, ChainResult};
use crate::storage::{LedgerStore, ProductRegistration};
use crate::types::{ProductId, Stage, StageEvent, StageSubmission};

/// One mutex per product, handed out on demand. Serialises stage recording
/// for a product while leaving other products independent.
#[derive(Default)]
pub struct ProductLocks {
    locks: Mutex<HashMap<ProductId, Arc<Mutex<()>>>>,
}

impl ProductLocks {
    pub fn lock_for(&self, product_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(product_id.to_string())
            .or_default()
            .clone()
    }
}

#[derive(Clone, Debug)]
struct ProductRecord {
    registration: ProductRegistration,
    highest: Option<Stage>,
    event_count: usize,
}

/// A validated, timestamped event that has not been committed yet.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedStage {
    pub event: StageEvent,
    pub needs_registration: bool,
}

pub struct StageRegistry {
    config: RegistryConfig,
    products: RwLock<HashMap<ProductId, ProductRecord>>,
    locks: ProductLocks,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl StageRegistry {
    pub fn new(config: RegistryConfig, store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            products: RwLock::new(HashMap::new()),
            locks: ProductLocks::default(),
            store,
            clock,
        }
    }

    /// Rebuilds product state from registrations and every recorded event,
    /// mined and pending.
    pub fn replay<'a>(
        config: RegistryConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        registrations: Vec<ProductRegistration>,
        events: impl IntoIterator<Item = &'a StageEvent>,
    ) -> Self {
        let registry = Self::new(config, store, clock);
        {
            let mut products = registry.products.write();
            for registration in registrations {
                products.insert(
                    registration.product_id.clone(),
                    ProductRecord {
                        registration,
                        highest: None,
                        event_count: 0,
                    },
                );
            }
            for event in events {
                let record = products
                    .entry(event.product_id.clone())
                    .or_insert_with(|| ProductRecord {
                        registration: ProductRegistration {
                            product_id: event.product_id.clone(),
                            registered_at: event.timestamp,
                        },
                        highest: None,
                        event_count: 0,
                    });
                record.highest = record.highest.max(Some(event.stage));
                record.event_count += 1;
            }
            debug!(products = products.len(), "replayed stage registry");
        }
        registry
    }

    pub fn product_lock(&self, product_id: &str) -> Arc<Mutex<()>> {
        self.locks.lock_for(product_id)
    }

    /// Idempotent: registering a known product returns its first registration.
    pub fn register_product(&self, product_id: &str) -> ChainResult<ProductRegistration> {
        if product_id.trim().is_empty() {
            return Err(ChainError::ProductNotFound(product_id.to_string()));
        }
        if let Some(record) = self.products.read().get(product_id) {
            return Ok(record.registration.clone());
        }
        let registration = self.draft_registration(product_id);
        self.store.store_product(&registration)?;
        Ok(self.install_registration(registration))
    }

    /// Registration stamped with the current time. Nothing is stored.
    pub fn draft_registration(&self, product_id: &str) -> ProductRegistration {
        ProductRegistration {
            product_id: product_id.to_string(),
            registered_at: self.clock.now(),
        }
    }

    /// Adds a persisted registration to the in-memory view. An existing
    /// registration wins.
    pub fn install_registration(&self, registration: ProductRegistration) -> ProductRegistration {
        let mut products = self.products.write();
        let record = products
            .entry(registration.product_id.clone())
            .or_insert_with(|| {
                info!(product = %registration.product_id, "registered product");
                ProductRecord {
                    registration,
                    highest: None,
                    event_count: 0,
                }
            });
        record.registration.clone()
    }

    /// Validates ordering and stamps the server timestamp. Callers hold the
    /// product lock until [`StageRegistry::commit_event`].
    pub fn prepare(&self, submission: StageSubmission) -> ChainResult<PreparedStage> {
        submission.validate_readings()?;
        let known = self
            .products
            .read()
            .get(&submission.product_id)
            .map(|record| record.highest);
        let needs_registration = match known {
            Some(recorded) => {
                if let Some(highest) = recorded {
                    if submission.stage < highest {
                        return Err(ChainError::OutOfOrderStage {
                            product_id: submission.product_id,
                            stage: submission.stage,
                            highest,
                        });
                    }
                }
                false
            }
            None if self.config.auto_register_products && !submission.product_id.trim().is_empty() => true,
            None => return Err(ChainError::ProductNotFound(submission.product_id)),
        };
        Ok(PreparedStage {
            event: submission.finalize(self.clock.now()),
            needs_registration,
        })
    }

    /// Applies a persisted event to the in-memory view.
    pub fn commit_event(&self, event: &StageEvent) {
        let mut products = self.products.write();
        let record = products
            .entry(event.product_id.clone())
            .or_insert_with(|| ProductRecord {
                registration: ProductRegistration {
                    product_id: event.product_id.clone(),
                    registered_at: event.timestamp,
                },
                highest: None,
                event_count: 0,
            });
        record.highest = record.highest.max(Some(event.stage));
        record.event_count += 1;
    }

    pub fn is_registered(&self, product_id: &str) -> bool {
        self.products.read().contains_key(product_id)
    }

    pub fn highest_stage(&self, product_id: &str) -> Option<Stage> {
        self.products.read().get(product_id).and_then(|record| record.highest)
    }

    pub fn event_count(&self, product_id: &str) -> usize {
        self.products
            .read()
            .get(product_id)
            .map_or(0, |record| record.event_count)
    }

    pub fn product_count(&self) -> usize {
        self.products.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use crate::types::ActorRole;

    fn registry(auto_register: bool) -> (StageRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = StageRegistry::new(
            RegistryConfig {
                auto_register_products: auto_register,
            },
            store.clone(),
            Arc::new(ManualClock::new(77)),
        );
        (registry, store)
    }

    fn submission(product: &str, stage: Stage) -> StageSubmission {
        StageSubmission::new(product, stage, ActorRole::Farmer, "f-1", "Soubre")
    }

    fn record(registry: &StageRegistry, product: &str, stage: Stage) -> ChainResult<StageEvent> {
        let prepared = registry.prepare(submission(product, stage))?;
        if prepared.needs_registration {
            registry.register_product(product)?;
        }
        registry.commit_event(&prepared.event);
        Ok(prepared.event)
    }

    #[test]
    fn stages_may_repeat_but_not_regress() {
        let (registry, _) = registry(true);
        record(&registry, "p", Stage::Planted).expect("planted");
        record(&registry, "p", Stage::Harvested).expect("harvested");
        record(&registry, "p", Stage::Harvested).expect("correction");
        let err = record(&registry, "p", Stage::Growing).expect_err("regression");
        assert!(matches!(
            err,
            ChainError::OutOfOrderStage { stage: Stage::Growing, highest: Stage::Harvested, .. }
        ));
        assert_eq!(registry.event_count("p"), 3);
        assert_eq!(registry.highest_stage("p"), Some(Stage::Harvested));
    }

    #[test]
    fn timestamps_come_from_the_clock() {
        let (registry, _) = registry(true);
        let event = record(&registry, "p", Stage::Planted).expect("planted");
        assert_eq!(event.timestamp, 77);
    }

    #[test]
    fn unknown_products_rejected_without_auto_registration() {
        let (registry, store) = registry(false);
        assert!(matches!(
            registry.prepare(submission("ghost", Stage::Planted)),
            Err(ChainError::ProductNotFound(_))
        ));
        registry.register_product("ghost").expect("register");
        registry.register_product("ghost").expect("register again");
        assert_eq!(store.load_products().expect("products").len(), 1);
        record(&registry, "ghost", Stage::Planted).expect("registered product");
    }

    #[test]
    fn non_finite_readings_never_reach_the_registry() {
        let (registry, store) = registry(true);
        let err = registry
            .prepare(submission("p", Stage::QualityChecked).with_quality_score(f64::NAN))
            .expect_err("nan score");
        assert!(matches!(err, ChainError::NonFiniteReading { field: "quality_score", .. }));
        assert!(!registry.is_registered("p"));
        assert!(store.load_products().expect("products").is_empty());
    }

    #[test]
    fn drafted_registrations_install_once() {
        let (registry, store) = registry(true);
        let first = registry.draft_registration("p");
        assert!(!registry.is_registered("p"));
        assert_eq!(registry.install_registration(first.clone()), first);
        let later = ProductRegistration {
            product_id: "p".to_string(),
            registered_at: 500,
        };
        assert_eq!(registry.install_registration(later), first);
        assert!(store.load_products().expect("products").is_empty());
    }

    #[test]
    fn replay_restores_highest_stage() {
        let (registry, store) = registry(true);
        let events = [
            record(&registry, "p", Stage::Planted).expect("planted"),
            record(&registry, "p", Stage::Shipped).expect("shipped"),
        ];
        let replayed = StageRegistry::replay(
            RegistryConfig::default(),
            store.clone(),
            Arc::new(ManualClock::new(90)),
            store.load_products().expect("products"),
            events.iter(),
        );
        assert_eq!(replayed.highest_stage("p"), Some(Stage::Shipped));
        assert!(matches!(
            replayed.prepare(submission("p", Stage::Packaged)),
            Err(ChainError::OutOfOrderStage { .. })
        ));
    }

    #[test]
    fn product_locks_are_shared_per_product() {
        let locks = ProductLocks::default();
        let first = locks.lock_for("p");
        let second = locks.lock_for("p");
        let other = locks.lock_for("q");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
