use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use simcat_core::{CountryRef, NormalizedPackage, Provider, ProviderSeed, StalePackage};
use simcat_storage::{CatalogStore, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SyncError;

/// Per-record error messages kept on a report; the counters stay exact.
const MAX_REPORTED_ERRORS: usize = 20;

/// Stale candidates listed by a dry-run purge.
const PURGE_PREVIEW: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn record_failure(&mut self, message: String) {
        self.failed += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.fetched += other.fetched;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        let room = MAX_REPORTED_ERRORS.saturating_sub(self.errors.len());
        self.errors.extend(other.errors.into_iter().take(room));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurgeReport {
    pub retention_days: u32,
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
    pub count: u64,
    /// First candidates by age; only filled on dry runs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<StalePackage>,
}

/// Converges stored packages to the records a provider returned.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub async fn resolve_provider(&self, seed: &ProviderSeed) -> Result<Provider, SyncError> {
        Ok(self.store.get_or_create_provider(seed).await?)
    }

    /// The stored provider for `slug`, without creating it.
    pub async fn existing_provider(&self, slug: &str) -> Result<Option<Provider>, SyncError> {
        Ok(self.store.provider_by_slug(slug).await?)
    }

    pub async fn resolve_countries(
        &self,
        countries: &[CountryRef],
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::with_capacity(countries.len());
        for country in countries {
            ids.push(self.store.resolve_or_create_country(country).await?.id);
        }
        Ok(ids)
    }

    /// Upserts every record independently. A failing record is logged and
    /// counted; the rest of the batch still runs. With `target_country`,
    /// records that do not cover it are skipped.
    pub async fn reconcile(
        &self,
        provider: &Provider,
        records: &[NormalizedPackage],
        target_country: Option<&str>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for record in records {
            if let Some(code) = target_country {
                if !record.covers(code) {
                    debug!(
                        provider = %provider.slug,
                        country = code,
                        name = %record.name,
                        "record does not cover target country"
                    );
                    report.skipped += 1;
                    continue;
                }
            }

            match self.apply(provider.id, record).await {
                Ok(true) => report.created += 1,
                Ok(false) => report.updated += 1,
                Err(err) => {
                    warn!(
                        provider = %provider.slug,
                        error = %err,
                        raw = %record.detail,
                        "failed to reconcile record"
                    );
                    report.record_failure(format!("{}: {err}", record.name));
                }
            }
        }

        info!(
            provider = %provider.slug,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "reconciled provider records"
        );
        report
    }

    async fn apply(
        &self,
        provider_id: Uuid,
        record: &NormalizedPackage,
    ) -> Result<bool, StoreError> {
        let country_ids = self.resolve_countries(&record.countries).await?;
        let outcome = self.store.upsert_package(provider_id, record).await?;
        self.store
            .set_package_countries(outcome.package_id, &country_ids)
            .await?;
        Ok(outcome.created)
    }

    pub async fn deactivate_for_country(
        &self,
        provider: &Provider,
        country_code: &str,
    ) -> Result<u64, SyncError> {
        let count = self
            .store
            .deactivate_for_country(provider.id, country_code)
            .await?;
        info!(
            provider = %provider.slug,
            country = country_code,
            count,
            "deactivated country packages"
        );
        Ok(count)
    }

    pub async fn deactivate_provider(&self, provider: &Provider) -> Result<u64, SyncError> {
        let count = self.store.deactivate_provider(provider.id).await?;
        info!(provider = %provider.slug, count, "deactivated provider packages");
        Ok(count)
    }

    /// Hard-deletes inactive packages untouched for `retention_days`.
    pub async fn purge_stale(
        &self,
        retention_days: u32,
        dry_run: bool,
    ) -> Result<PurgeReport, SyncError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));

        if dry_run {
            let stale = self.store.find_stale(cutoff).await?;
            info!(retention_days, count = stale.len(), "stale packages found (dry run)");
            return Ok(PurgeReport {
                retention_days,
                cutoff,
                dry_run,
                count: stale.len() as u64,
                candidates: stale.into_iter().take(PURGE_PREVIEW).collect(),
            });
        }

        let count = self.store.delete_stale(cutoff).await?;
        info!(retention_days, count, "stale packages deleted");
        Ok(PurgeReport {
            retention_days,
            cutoff,
            dry_run,
            count,
            candidates: Vec::new(),
        })
    }
}
