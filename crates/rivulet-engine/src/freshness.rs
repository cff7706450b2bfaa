//! Source freshness checks
//!
//! Compares the age of the newest `loaded_at_field` value in each contracted
//! source against its warn/error thresholds. Advisory only; staleness never
//! blocks materialization.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rivulet_compile::ResolutionContext;
use rivulet_core::{FreshnessResult, FreshnessState, SourceDecl};
use rivulet_store::StoreAdapter;
use tracing::{debug, warn};

pub struct FreshnessMonitor {
    store: Arc<dyn StoreAdapter>,
    now: Option<DateTime<Utc>>,
}

impl FreshnessMonitor {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store, now: None }
    }

    /// Pin the clock; tests measure ages against a fixed instant
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Check every source with a declared contract
    pub async fn check_sources(
        &self,
        sources: &[SourceDecl],
        context: &ResolutionContext,
    ) -> Vec<FreshnessResult> {
        let mut results = Vec::new();
        for source in sources {
            if source.freshness.is_some() {
                results.push(self.check_one(source, context).await);
            }
        }
        results
    }

    async fn check_one(&self, source: &SourceDecl, context: &ResolutionContext) -> FreshnessResult {
        let node_id = source.node_id();
        let Some(contract) = &source.freshness else {
            return FreshnessResult {
                source: node_id,
                state: FreshnessState::Fresh,
                age_minutes: None,
                detail: None,
            };
        };

        let Some(address) = context.source_address(&source.source, &source.table) else {
            return stale_error(node_id, None, "source address is not resolvable");
        };

        let newest = match self
            .store
            .newest_timestamp(address, &contract.loaded_at_field)
            .await
        {
            Ok(newest) => newest,
            Err(e) => {
                warn!(source = %node_id, error = %e, "freshness probe failed");
                return stale_error(node_id, None, &e.to_string());
            }
        };

        // An empty source has no measurable age; that is reported as the
        // hardest staleness rather than silently passing.
        let Some(newest) = newest else {
            return stale_error(node_id, None, "source has no readable rows");
        };

        let now = self.now.unwrap_or_else(Utc::now);
        let age_minutes = (now - newest).num_minutes().max(0) as u64;

        // A source sitting exactly at a threshold has already crossed it;
        // fresh means strictly below the warn threshold.
        let state = match contract.error_after_minutes {
            Some(threshold) if age_minutes >= threshold => FreshnessState::StaleError,
            _ => match contract.warn_after_minutes {
                Some(threshold) if age_minutes >= threshold => FreshnessState::StaleWarn,
                _ => FreshnessState::Fresh,
            },
        };
        debug!(source = %node_id, age_minutes, state = %state, "freshness checked");

        FreshnessResult {
            source: node_id,
            state,
            age_minutes: Some(age_minutes),
            detail: None,
        }
    }
}

fn stale_error(source: String, age_minutes: Option<u64>, detail: &str) -> FreshnessResult {
    FreshnessResult {
        source,
        state: FreshnessState::StaleError,
        age_minutes,
        detail: Some(detail.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use rivulet_core::Project;
    use rivulet_store::memory::rows_from_json;
    use rivulet_store::{MemoryStore, ObjectAddress};
    use std::path::Path;

    const PROJECT: &str = r#"
        [project]
        name = "analytics"

        [targets.dev]
        database = "dev_db"
        schema = "main"

        [[sources]]
        source = "raw"
        table = "orders"
        schema = "landing"
        freshness = { loaded_at_field = "loaded_at", warn_after_minutes = 720, error_after_minutes = 1440 }

        [[sources]]
        source = "raw"
        table = "payments"
        schema = "landing"
        freshness = { loaded_at_field = "loaded_at", warn_after_minutes = 1440, error_after_minutes = 4320 }

        [[sources]]
        source = "raw"
        table = "customers"
        schema = "landing"
    "#;

    fn loaded_at(now: DateTime<Utc>, hours_ago: i64) -> String {
        (now - Duration::hours(hours_ago)).to_rfc3339()
    }

    #[tokio::test]
    async fn thresholds_classify_sources() {
        let project = Project::from_toml(PROJECT, Path::new(".")).unwrap();
        let context = ResolutionContext::for_active_target(&project).unwrap();
        let now = Utc::now();

        let store = Arc::new(MemoryStore::new());
        store
            .seed_table(
                &ObjectAddress::new("dev_db", "landing", "orders"),
                rows_from_json(serde_json::json!([
                    {"order_id": 1, "loaded_at": loaded_at(now, 30)}
                ])),
            )
            .await;
        store
            .seed_table(
                &ObjectAddress::new("dev_db", "landing", "payments"),
                rows_from_json(serde_json::json!([
                    {"payment_id": 1, "loaded_at": loaded_at(now, 5)}
                ])),
            )
            .await;

        let monitor = FreshnessMonitor::new(store).at(now);
        let results = monitor.check_sources(&project.sources, &context).await;

        // customers has no contract and is not checked
        assert_eq!(results.len(), 2);

        let orders = &results[0];
        assert_eq!(orders.source, "source.raw.orders");
        assert_eq!(orders.state, FreshnessState::StaleError);
        assert_eq!(orders.age_minutes, Some(30 * 60));

        let payments = &results[1];
        assert_eq!(payments.source, "source.raw.payments");
        assert_eq!(payments.state, FreshnessState::Fresh);
        assert_eq!(payments.age_minutes, Some(5 * 60));
    }

    #[tokio::test]
    async fn warn_band_between_thresholds() {
        let project = Project::from_toml(PROJECT, Path::new(".")).unwrap();
        let context = ResolutionContext::for_active_target(&project).unwrap();
        let now = Utc::now();

        let store = Arc::new(MemoryStore::new());
        store
            .seed_table(
                &ObjectAddress::new("dev_db", "landing", "orders"),
                rows_from_json(serde_json::json!([
                    {"order_id": 1, "loaded_at": loaded_at(now, 18)}
                ])),
            )
            .await;

        let monitor = FreshnessMonitor::new(store).at(now);
        let results = monitor
            .check_sources(&project.sources[..1], &context)
            .await;
        assert_eq!(results[0].state, FreshnessState::StaleWarn);
    }

    #[tokio::test]
    async fn ages_exactly_at_the_thresholds_have_crossed_them() {
        let project = Project::from_toml(PROJECT, Path::new(".")).unwrap();
        let context = ResolutionContext::for_active_target(&project).unwrap();
        let now = Utc::now();
        let address = ObjectAddress::new("dev_db", "landing", "orders");

        // orders contract: warn after 720 minutes, error after 1440
        for (age_minutes, expected) in [
            (719, FreshnessState::Fresh),
            (720, FreshnessState::StaleWarn),
            (1440, FreshnessState::StaleError),
        ] {
            let store = Arc::new(MemoryStore::new());
            store
                .seed_table(
                    &address,
                    rows_from_json(serde_json::json!([
                        {"order_id": 1, "loaded_at": (now - Duration::minutes(age_minutes)).to_rfc3339()}
                    ])),
                )
                .await;

            let monitor = FreshnessMonitor::new(store).at(now);
            let results = monitor
                .check_sources(&project.sources[..1], &context)
                .await;
            assert_eq!(results[0].state, expected, "age {} minutes", age_minutes);
            assert_eq!(results[0].age_minutes, Some(age_minutes as u64));
        }
    }

    #[tokio::test]
    async fn empty_source_is_stale_error() {
        let project = Project::from_toml(PROJECT, Path::new(".")).unwrap();
        let context = ResolutionContext::for_active_target(&project).unwrap();

        let store = Arc::new(MemoryStore::new());
        store
            .seed_table(&ObjectAddress::new("dev_db", "landing", "orders"), vec![])
            .await;

        let monitor = FreshnessMonitor::new(store);
        let results = monitor
            .check_sources(&project.sources[..1], &context)
            .await;
        assert_eq!(results[0].state, FreshnessState::StaleError);
        assert!(results[0].detail.as_deref().unwrap().contains("no readable rows"));
    }
}
