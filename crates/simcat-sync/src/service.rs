use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use simcat_adapters::format_package_name;
use simcat_core::{CatalogStats, Country, CountryRef, PackageFilter, PackagePage, ValidationReport};
use simcat_storage::CatalogStore;
use tracing::{info, warn};

use crate::jobs::{JobCommand, JobHandler, JobResult};
use crate::orchestrator::{Orchestrator, SyncIntent};
use crate::quality::{validate, VALIDATION_ISSUE_LIMIT};
use crate::reconcile::PurgeReport;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupportedCountries {
    pub database_countries: Vec<Country>,
    /// Per provider slug; a provider whose lookup failed maps to an empty list.
    pub remote: BTreeMap<String, Vec<CountryRef>>,
}

/// Application-facing operations: sync intents, maintenance, and catalog reads.
#[derive(Clone)]
pub struct CatalogService {
    orchestrator: Orchestrator,
    store: Arc<dyn CatalogStore>,
}

impl CatalogService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let store = orchestrator.reconciler().store().clone();
        Self { orchestrator, store }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub async fn run_intent(&self, intent: &SyncIntent) -> Result<JobResult, SyncError> {
        let orch = &self.orchestrator;
        let result = match intent {
            SyncIntent::SyncAll => {
                let outcome = orch.sync_all().await?;
                JobResult::success("all packages synced").with_details(&outcome)
            }
            SyncIntent::SyncCountry { country } => {
                let outcome = orch.sync_country(country).await?;
                JobResult::success(format!("{} packages synced", country.to_uppercase()))
                    .with_details(&outcome)
            }
            SyncIntent::UpdateCountry { country } => {
                let outcome = orch.update_country(country).await?;
                JobResult::success(format!("{} packages updated", country.to_uppercase()))
                    .with_details(&outcome)
            }
            SyncIntent::BatchSync { countries } => {
                let summary = orch.batch_sync(countries).await;
                let message = format!("batch sync finished for {} countries", countries.len());
                JobResult::completed(message).with_details(&summary)
            }
            SyncIntent::BatchUpdate { countries } => {
                let summary = orch.batch_update(countries).await;
                let message = format!("batch update finished for {} countries", countries.len());
                JobResult::completed(message).with_details(&summary)
            }
            SyncIntent::SyncProvider { provider } => {
                let outcome = orch.sync_provider(provider).await?;
                JobResult::success(format!("{provider} packages synced")).with_details(&outcome)
            }
            SyncIntent::UpdateProvider { provider } => {
                let outcome = orch.update_provider(provider).await?;
                JobResult::success(format!("{provider} packages updated")).with_details(&outcome)
            }
        };
        Ok(result)
    }

    pub async fn cleanup(
        &self,
        retention_days: u32,
        dry_run: bool,
    ) -> Result<PurgeReport, SyncError> {
        self.orchestrator
            .reconciler()
            .purge_stale(retention_days, dry_run)
            .await
    }

    pub async fn validate(&self) -> Result<ValidationReport, SyncError> {
        validate(self.store.as_ref(), VALIDATION_ISSUE_LIMIT).await
    }

    /// Filtered page of active packages with provider-specific display names.
    pub async fn search(&self, filter: &PackageFilter) -> Result<PackagePage, SyncError> {
        let mut page = self.store.search(filter).await?;
        for listing in &mut page.packages {
            let formatted = format_package_name(&listing.provider.slug, &listing.name);
            listing.formatted_name = Some(formatted);
        }
        Ok(page)
    }

    pub async fn stats(&self) -> Result<CatalogStats, SyncError> {
        Ok(self.store.stats().await?)
    }

    /// All stored countries, or those with active packages of `provider`.
    pub async fn countries(&self, provider: Option<&str>) -> Result<Vec<Country>, SyncError> {
        Ok(self.store.countries(provider).await?)
    }

    /// Stored countries plus each provider's own country list.
    pub async fn supported_countries(&self) -> Result<SupportedCountries, SyncError> {
        let database_countries = self.store.countries(None).await?;
        let mut remote = BTreeMap::new();
        for adapter in self.orchestrator.registry().adapters() {
            let countries = match adapter.remote_countries(self.orchestrator.http()).await {
                Ok(countries) => countries,
                Err(err) => {
                    warn!(provider = adapter.slug(), error = %err, "remote country lookup failed");
                    Vec::new()
                }
            };
            remote.insert(adapter.slug().to_string(), countries);
        }
        Ok(SupportedCountries {
            database_countries,
            remote,
        })
    }
}

#[async_trait]
impl JobHandler for CatalogService {
    async fn handle(&self, command: &JobCommand) -> Result<JobResult, SyncError> {
        match command {
            JobCommand::Sync(intent) => self.run_intent(intent).await,
            JobCommand::Cleanup { days, dry_run } => {
                let report = self.cleanup(*days, *dry_run).await?;
                let message = if report.dry_run {
                    format!("{} packages would be deleted", report.count)
                } else {
                    format!("{} packages deleted", report.count)
                };
                info!(count = report.count, dry_run = report.dry_run, "cleanup finished");
                Ok(JobResult::success(message).with_details(&report))
            }
            JobCommand::Validate => {
                let report = self.validate().await?;
                Ok(JobResult::success("validation finished").with_details(&report))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use simcat_storage::MemoryCatalogStore;

    use super::*;
    use crate::jobs::JobResultStatus;
    use crate::orchestrator::tests::{bundle, orchestrator, FakeAdapter};

    fn service(store: Arc<MemoryCatalogStore>, catalog: Vec<serde_json::Value>) -> CatalogService {
        let go = Arc::new(FakeAdapter::new("esimgo", catalog));
        CatalogService::new(orchestrator(store, vec![go]))
    }

    #[tokio::test]
    async fn sync_command_reports_counts() {
        let store = Arc::new(MemoryCatalogStore::new());
        let svc = service(store, vec![bundle("a", &["TR"]), bundle("b", &["TR", "US"])]);

        let result = svc
            .handle(&JobCommand::Sync(SyncIntent::SyncCountry {
                country: "tr".into(),
            }))
            .await
            .expect("sync");
        assert_eq!(result.status, JobResultStatus::Success);
        assert_eq!(result.message, "TR packages synced");
        assert_eq!(result.details["totals"]["created"], 2);
    }

    #[tokio::test]
    async fn batch_command_is_completed_even_with_failures() {
        let store = Arc::new(MemoryCatalogStore::new());
        let svc = service(store, vec![bundle("a", &["TR"])]);

        let result = svc
            .handle(&JobCommand::Sync(SyncIntent::BatchSync {
                countries: vec!["TR".into(), "XX".into()],
            }))
            .await
            .expect("batch");
        assert_eq!(result.status, JobResultStatus::Completed);
        assert_eq!(result.details["success_count"], 1);
        assert_eq!(result.details["error_count"], 1);
    }

    #[tokio::test]
    async fn search_fills_formatted_names_and_cleanup_counts() {
        let store = Arc::new(MemoryCatalogStore::new());
        let raw = json!({
            "id": "g1",
            "name": "Turkey, 7 Days, 1GB",
            "price": "2.00",
            "mb": 1024,
            "countries": ["TR"]
        });
        let svc = service(store, vec![raw]);
        svc.run_intent(&SyncIntent::SyncAll).await.expect("sync");

        let page = svc.search(&PackageFilter::default()).await.expect("search");
        assert_eq!(page.packages.len(), 1);
        assert!(page.packages[0].formatted_name.is_some());

        let result = svc
            .handle(&JobCommand::Cleanup {
                days: 30,
                dry_run: true,
            })
            .await
            .expect("cleanup");
        assert_eq!(result.message, "0 packages would be deleted");
    }
}
