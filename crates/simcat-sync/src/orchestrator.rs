use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use simcat_adapters::{ProviderAdapter, ProviderRegistry};
use simcat_core::NormalizedPackage;
use simcat_storage::{CatalogStore, HttpFetcher};
use tracing::{error, info, info_span, warn, Instrument};

use crate::reconcile::{ReconcileReport, Reconciler};
use crate::SyncError;

/// One requested synchronization. Each intent is executed once, start to finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum SyncIntent {
    SyncAll,
    SyncCountry { country: String },
    UpdateCountry { country: String },
    BatchSync { countries: Vec<String> },
    BatchUpdate { countries: Vec<String> },
    SyncProvider { provider: String },
    UpdateProvider { provider: String },
}

impl fmt::Display for SyncIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyncAll => f.write_str("sync_all"),
            Self::SyncCountry { country } => write!(f, "sync_country({country})"),
            Self::UpdateCountry { country } => write!(f, "update_country({country})"),
            Self::BatchSync { countries } => write!(f, "batch_sync({})", countries.join(",")),
            Self::BatchUpdate { countries } => write!(f, "batch_update({})", countries.join(",")),
            Self::SyncProvider { provider } => write!(f, "sync_provider({provider})"),
            Self::UpdateProvider { provider } => write!(f, "update_provider({provider})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSyncReport {
    pub provider: String,
    pub deactivated: u64,
    #[serde(flatten)]
    pub reconcile: ReconcileReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub providers: Vec<ProviderSyncReport>,
    pub totals: ReconcileReport,
}

impl SyncOutcome {
    fn from_reports(providers: Vec<ProviderSyncReport>) -> Self {
        let mut totals = ReconcileReport::default();
        for report in &providers {
            totals.merge(report.reconcile.clone());
        }
        Self { providers, totals }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryResult {
    pub country: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Batch results; `status` is always `completed`, failures are per country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub status: String,
    pub success_count: usize,
    pub error_count: usize,
    pub results: Vec<CountryResult>,
}

/// Trims and upper-cases a country code, rejecting anything that is not
/// 2 to 12 letters, digits or dashes.
pub fn normalize_country_code(code: &str) -> Result<String, SyncError> {
    let normalized = code.trim().to_uppercase();
    let valid = (2..=12).contains(&normalized.len())
        && normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(normalized)
    } else {
        Err(SyncError::InvalidCountryCode(code.to_string()))
    }
}

#[derive(Clone, Copy)]
enum CountryMode {
    Sync,
    Update,
}

/// Runs sync intents sequentially over the registered adapters.
#[derive(Clone)]
pub struct Orchestrator {
    registry: ProviderRegistry,
    reconciler: Reconciler,
    http: Arc<HttpFetcher>,
}

impl Orchestrator {
    pub fn new(
        registry: ProviderRegistry,
        store: Arc<dyn CatalogStore>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            registry,
            reconciler: Reconciler::new(store),
            http,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    fn adapters(&self) -> Result<Vec<Arc<dyn ProviderAdapter>>, SyncError> {
        if self.registry.is_empty() {
            return Err(SyncError::NoProviders);
        }
        Ok(self.registry.adapters().cloned().collect())
    }

    fn adapter(&self, slug: &str) -> Result<Arc<dyn ProviderAdapter>, SyncError> {
        self.registry
            .get(slug)
            .ok_or_else(|| SyncError::UnknownProvider(slug.to_string()))
    }

    pub async fn sync_all(&self) -> Result<SyncOutcome, SyncError> {
        let mut reports = Vec::new();
        for adapter in self.adapters()? {
            reports.push(self.sync_adapter(adapter.as_ref(), None, 0).await?);
        }
        Ok(SyncOutcome::from_reports(reports))
    }

    pub async fn sync_country(&self, country_code: &str) -> Result<SyncOutcome, SyncError> {
        self.run_country(country_code, CountryMode::Sync).await
    }

    /// Deactivates each provider's packages for the country, then syncs it, so
    /// anything the provider stopped returning stays inactive.
    pub async fn update_country(&self, country_code: &str) -> Result<SyncOutcome, SyncError> {
        self.run_country(country_code, CountryMode::Update).await
    }

    async fn deactivate_country(&self, slug: &str, code: &str) -> Result<u64, SyncError> {
        match self.reconciler.existing_provider(slug).await? {
            Some(provider) => self.reconciler.deactivate_for_country(&provider, code).await,
            None => {
                warn!(provider = slug, "provider not stored yet; nothing to deactivate");
                Ok(0)
            }
        }
    }

    async fn run_country(
        &self,
        country_code: &str,
        mode: CountryMode,
    ) -> Result<SyncOutcome, SyncError> {
        let code = normalize_country_code(country_code)?;
        let adapters = self.adapters()?;

        let mut deactivated = Vec::with_capacity(adapters.len());
        for adapter in &adapters {
            let count = match mode {
                CountryMode::Sync => 0,
                CountryMode::Update => self.deactivate_country(adapter.slug(), &code).await?,
            };
            deactivated.push(count);
        }

        let mut reports = Vec::with_capacity(adapters.len());
        for (adapter, count) in adapters.iter().zip(deactivated) {
            reports.push(self.sync_adapter(adapter.as_ref(), Some(&code), count).await?);
        }
        Ok(SyncOutcome::from_reports(reports))
    }

    pub async fn batch_sync(&self, country_codes: &[String]) -> BatchSummary {
        self.run_batch(country_codes, CountryMode::Sync).await
    }

    pub async fn batch_update(&self, country_codes: &[String]) -> BatchSummary {
        self.run_batch(country_codes, CountryMode::Update).await
    }

    async fn run_batch(&self, country_codes: &[String], mode: CountryMode) -> BatchSummary {
        let mut results = Vec::with_capacity(country_codes.len());
        for code in country_codes {
            let outcome = self
                .run_country(code, mode)
                .instrument(info_span!("batch_item", country = %code))
                .await;
            results.push(match outcome {
                Ok(_) => CountryResult {
                    country: code.clone(),
                    status: "success".to_string(),
                    message: None,
                },
                Err(err) => {
                    error!(country = %code, error = %err, "country sync failed inside batch");
                    CountryResult {
                        country: code.clone(),
                        status: "error".to_string(),
                        message: Some(err.to_string()),
                    }
                }
            });
        }

        let success_count = results.iter().filter(|r| r.status == "success").count();
        let error_count = results.len() - success_count;
        info!(success_count, error_count, "batch finished");
        BatchSummary {
            status: "completed".to_string(),
            success_count,
            error_count,
            results,
        }
    }

    pub async fn sync_provider(&self, slug: &str) -> Result<SyncOutcome, SyncError> {
        let adapter = self.adapter(slug)?;
        let report = self.sync_adapter(adapter.as_ref(), None, 0).await?;
        Ok(SyncOutcome::from_reports(vec![report]))
    }

    /// Deactivates every package of the provider, then runs a full sync of it.
    pub async fn update_provider(&self, slug: &str) -> Result<SyncOutcome, SyncError> {
        let adapter = self.adapter(slug)?;
        let deactivated = match self.reconciler.existing_provider(slug).await? {
            Some(provider) => self.reconciler.deactivate_provider(&provider).await?,
            None => 0,
        };
        let report = self.sync_adapter(adapter.as_ref(), None, deactivated).await?;
        Ok(SyncOutcome::from_reports(vec![report]))
    }

    async fn sync_adapter(
        &self,
        adapter: &dyn ProviderAdapter,
        country: Option<&str>,
        deactivated: u64,
    ) -> Result<ProviderSyncReport, SyncError> {
        let span = info_span!(
            "provider_sync",
            provider = adapter.slug(),
            country = country.unwrap_or("*")
        );
        async {
            let raws = match country {
                Some(code) => adapter.fetch_for_country(&self.http, code).await?,
                None => adapter.fetch_all(&self.http).await?,
            };

            let mut report = ReconcileReport {
                fetched: raws.len(),
                ..ReconcileReport::default()
            };
            let mut normalized: Vec<NormalizedPackage> = Vec::with_capacity(raws.len());
            for raw in &raws {
                match adapter.normalize(raw) {
                    Ok(pkg) => normalized.push(pkg),
                    Err(err) => {
                        warn!(error = %err, raw = %raw, "skipping malformed record");
                        report.record_failure(err.to_string());
                    }
                }
            }

            let provider = self.reconciler.resolve_provider(&adapter.descriptor()).await?;
            report.merge(self.reconciler.reconcile(&provider, &normalized, country).await);

            Ok::<_, SyncError>(ProviderSyncReport {
                provider: adapter.slug().to_string(),
                deactivated,
                reconcile: report,
            })
        }
        .instrument(span)
        .await
    }
}
