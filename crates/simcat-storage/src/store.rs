use async_trait::async_trait;
use chrono::{DateTime, Utc};
use simcat_core::{
    CatalogStats, Country, CountryRef, NormalizedPackage, Package, PackageFilter, PackagePage,
    PackageSummary, Provider, ProviderSeed, StalePackage, UpsertOutcome,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} `{key}` not found")]
    NotFound { entity: &'static str, key: String },
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Persistence seam for the catalog. Each method is atomic on its own;
/// callers get no transaction spanning several calls.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Returns the provider row for `seed.slug`, creating it on first use.
    async fn get_or_create_provider(&self, seed: &ProviderSeed) -> Result<Provider, StoreError>;

    async fn provider_by_slug(&self, slug: &str) -> Result<Option<Provider>, StoreError>;

    /// Looks a country up by code, creating it when missing. Codes are
    /// unique; a name or flag is only filled in when the stored row lacks one.
    async fn resolve_or_create_country(&self, country: &CountryRef) -> Result<Country, StoreError>;

    /// Inserts or updates by identity and marks the package active.
    async fn upsert_package(
        &self,
        provider_id: Uuid,
        package: &NormalizedPackage,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Replaces the package's country set with exactly `country_ids`.
    async fn set_package_countries(
        &self,
        package_id: Uuid,
        country_ids: &[Uuid],
    ) -> Result<(), StoreError>;

    async fn package_country_codes(&self, package_id: Uuid) -> Result<Vec<String>, StoreError>;

    async fn get_package(&self, package_id: Uuid) -> Result<Option<Package>, StoreError>;

    /// Deactivates the provider's active packages linked to `country_code`.
    async fn deactivate_for_country(
        &self,
        provider_id: Uuid,
        country_code: &str,
    ) -> Result<u64, StoreError>;

    async fn deactivate_provider(&self, provider_id: Uuid) -> Result<u64, StoreError>;

    /// Inactive packages last updated before `cutoff`, oldest first.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<StalePackage>, StoreError>;

    /// Deletes inactive packages last updated before `cutoff` together with their links.
    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn active_packages(&self) -> Result<Vec<PackageSummary>, StoreError>;

    async fn search(&self, filter: &PackageFilter) -> Result<PackagePage, StoreError>;

    async fn stats(&self) -> Result<CatalogStats, StoreError>;

    /// All countries, or only those served by `provider_slug`'s active packages.
    async fn countries(&self, provider_slug: Option<&str>) -> Result<Vec<Country>, StoreError>;
}
