use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use simcat_core::{
    CatalogStats, Country, CountryBrief, CountryRef, CountryStats, DataAllowance, GeneralStats,
    NormalizedPackage, Package, PackageFilter, PackageIdentity, PackageListing, PackagePage,
    PackageSummary, Pagination, Provider, ProviderRef, ProviderSeed, ProviderStats, StalePackage,
    UpsertOutcome, TOP_COUNTRIES,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::store::{CatalogStore, StoreError};

const PROVIDER_COLUMNS: &str = "id, slug, name, credential, is_active, created_at, updated_at";
const COUNTRY_COLUMNS: &str = "id, code, name, flag, is_active, is_regional, is_global";

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }
}

fn provider_from_row(row: &PgRow) -> Result<Provider, sqlx::Error> {
    Ok(Provider {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        credential: row.try_get("credential")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn country_from_row(row: &PgRow) -> Result<Country, sqlx::Error> {
    Ok(Country {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        flag: row.try_get("flag")?,
        is_active: row.try_get("is_active")?,
        is_regional: row.try_get("is_regional")?,
        is_global: row.try_get("is_global")?,
    })
}

fn package_from_row(row: &PgRow) -> Result<Package, sqlx::Error> {
    Ok(Package {
        id: row.try_get("id")?,
        provider_id: row.try_get("provider_id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        price: row.try_get("price")?,
        validity_days: row.try_get("validity_days")?,
        data: DataAllowance::from_column(row.try_get("data_amount_mb")?),
        detail: row.try_get("detail")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn count(row: &PgRow, column: &str) -> Result<u64, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

fn normalize_code(code: &str) -> Result<String, StoreError> {
    let code = code.trim().to_uppercase();
    if code.is_empty() {
        return Err(StoreError::Invalid {
            field: "country_code",
            message: "country code is empty".to_string(),
        });
    }
    Ok(code)
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &PackageFilter) {
    if let Some(code) = filter.country.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        qb.push(
            " AND EXISTS (SELECT 1 FROM package_countries pc \
             JOIN countries c ON c.id = pc.country_id \
             WHERE pc.package_id = p.id AND c.code = ",
        )
        .push_bind(code.to_uppercase())
        .push(")");
    }
    if let Some(slug) = filter.provider.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND pr.slug = ").push_bind(slug.to_string());
    }
    if let Some(min) = filter.min_price {
        qb.push(" AND p.price >= ").push_bind(min);
    }
    if let Some(max) = filter.max_price {
        qb.push(" AND p.price <= ").push_bind(max);
    }
    if let Some(min) = filter.min_data {
        qb.push(" AND (p.data_amount_mb = -1 OR p.data_amount_mb >= ")
            .push_bind(min)
            .push(")");
    }
    if let Some(max) = filter.max_data {
        qb.push(" AND p.data_amount_mb <> -1 AND p.data_amount_mb <= ")
            .push_bind(max);
    }
    if let Some(min) = filter.min_validity {
        qb.push(" AND p.validity_days >= ").push_bind(min);
    }
    if let Some(max) = filter.max_validity {
        qb.push(" AND p.validity_days <= ").push_bind(max);
    }
    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        qb.push(" AND p.name ILIKE ")
            .push_bind(format!("%{}%", escape_like(term)));
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn get_or_create_provider(&self, seed: &ProviderSeed) -> Result<Provider, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let sql = format!(
            "INSERT INTO providers (id, slug, name, credential) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug \
             RETURNING {PROVIDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&seed.slug)
            .bind(&seed.name)
            .bind(&seed.credential)
            .fetch_one(&self.pool)
            .await?;
        Ok(provider_from_row(&row)?)
    }

    async fn provider_by_slug(&self, slug: &str) -> Result<Option<Provider>, StoreError> {
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE slug = $1");
        let row = sqlx::query(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(provider_from_row).transpose()?)
    }

    async fn resolve_or_create_country(&self, country: &CountryRef) -> Result<Country, StoreError> {
        let code = normalize_code(&country.code)?;
        let name = country
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(code.as_str())
            .to_string();
        let sql = format!(
            "INSERT INTO countries (id, code, name, flag) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (code) DO UPDATE SET \
               name = CASE WHEN countries.name = countries.code \
                 THEN EXCLUDED.name ELSE countries.name END, \
               flag = CASE WHEN countries.flag = '' THEN EXCLUDED.flag ELSE countries.flag END \
             RETURNING {COUNTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&code)
            .bind(&name)
            .bind(country.flag.clone().unwrap_or_default())
            .fetch_one(&self.pool)
            .await?;
        Ok(country_from_row(&row)?)
    }

    async fn upsert_package(
        &self,
        provider_id: Uuid,
        package: &NormalizedPackage,
    ) -> Result<UpsertOutcome, StoreError> {
        let identity = package.identity();
        let conflict = conflict_target(&identity);
        let external_id = match identity {
            PackageIdentity::External(id) => Some(id),
            PackageIdentity::Name(_) => None,
        };
        let sql = format!(
            "INSERT INTO packages \
               (id, provider_id, external_id, name, price, validity_days, data_amount_mb, detail, \
                is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, NOW(), NOW()) \
             ON CONFLICT {conflict} DO UPDATE SET \
               name = EXCLUDED.name, \
               price = EXCLUDED.price, \
               validity_days = EXCLUDED.validity_days, \
               data_amount_mb = EXCLUDED.data_amount_mb, \
               detail = EXCLUDED.detail, \
               is_active = TRUE, \
               updated_at = NOW() \
             RETURNING id, (xmax = 0) AS created"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(provider_id)
            .bind(external_id)
            .bind(&package.name)
            .bind(package.price)
            .bind(package.validity_days)
            .bind(package.data.to_column())
            .bind(&package.detail)
            .fetch_one(&self.pool)
            .await?;
        Ok(UpsertOutcome {
            package_id: row.try_get("id")?,
            created: row.try_get("created")?,
        })
    }

    async fn set_package_countries(
        &self,
        package_id: Uuid,
        country_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM package_countries WHERE package_id = $1")
            .bind(package_id)
            .execute(&mut *tx)
            .await?;
        if !country_ids.is_empty() {
            sqlx::query(
                "INSERT INTO package_countries (package_id, country_id) \
                 SELECT $1, UNNEST($2::uuid[]) ON CONFLICT DO NOTHING",
            )
            .bind(package_id)
            .bind(country_ids)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn package_country_codes(&self, package_id: Uuid) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.code FROM package_countries pc \
             JOIN countries c ON c.id = pc.country_id \
             WHERE pc.package_id = $1 ORDER BY c.code",
        )
        .bind(package_id)
        .fetch_all(&self.pool)
        .await?;
        let codes = rows
            .iter()
            .map(|row| row.try_get("code"))
            .collect::<Result<Vec<String>, sqlx::Error>>()?;
        Ok(codes)
    }

    async fn get_package(&self, package_id: Uuid) -> Result<Option<Package>, StoreError> {
        let row = sqlx::query(
            "SELECT id, provider_id, external_id, name, price, validity_days, data_amount_mb, \
                    detail, is_active, created_at, updated_at \
             FROM packages WHERE id = $1",
        )
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(package_from_row).transpose()?)
    }

    async fn deactivate_for_country(
        &self,
        provider_id: Uuid,
        country_code: &str,
    ) -> Result<u64, StoreError> {
        let code = normalize_code(country_code)?;
        let result = sqlx::query(
            "UPDATE packages p SET is_active = FALSE, updated_at = NOW() \
             WHERE p.provider_id = $1 AND p.is_active \
               AND EXISTS (SELECT 1 FROM package_countries pc \
                           JOIN countries c ON c.id = pc.country_id \
                           WHERE pc.package_id = p.id AND c.code = $2)",
        )
        .bind(provider_id)
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deactivate_provider(&self, provider_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE packages SET is_active = FALSE, updated_at = NOW() \
             WHERE provider_id = $1 AND is_active",
        )
        .bind(provider_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<StalePackage>, StoreError> {
        let rows = sqlx::query(
            "SELECT p.id, p.name, pr.name AS provider_name, p.updated_at \
             FROM packages p JOIN providers pr ON pr.id = p.provider_id \
             WHERE NOT p.is_active AND p.updated_at < $1 \
             ORDER BY p.updated_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let stale = rows
            .iter()
            .map(|row| {
                Ok(StalePackage {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    provider_name: row.try_get("provider_name")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(stale)
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // package_countries rows go with the package via ON DELETE CASCADE.
        let result =
            sqlx::query("DELETE FROM packages WHERE NOT is_active AND updated_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn active_packages(&self) -> Result<Vec<PackageSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT p.id, p.name, pr.name AS provider_name, p.price, p.validity_days, \
                    p.data_amount_mb, \
                    (SELECT COUNT(*) FROM package_countries pc WHERE pc.package_id = p.id) \
                      AS country_count \
             FROM packages p JOIN providers pr ON pr.id = p.provider_id \
             WHERE p.is_active ORDER BY p.updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let summaries = rows
            .iter()
            .map(|row| {
                Ok(PackageSummary {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    provider_name: row.try_get("provider_name")?,
                    price: row.try_get("price")?,
                    validity_days: row.try_get("validity_days")?,
                    data: DataAllowance::from_column(row.try_get("data_amount_mb")?),
                    country_count: count(row, "country_count")? as usize,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(summaries)
    }

    async fn search(&self, filter: &PackageFilter) -> Result<PackagePage, StoreError> {
        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS total FROM packages p \
             JOIN providers pr ON pr.id = p.provider_id WHERE p.is_active",
        );
        push_filters(&mut count_qb, filter);
        let total = count(&count_qb.build().fetch_one(&self.pool).await?, "total")?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT p.id, p.name, p.price, p.data_amount_mb, p.validity_days, p.created_at, \
                    p.updated_at, pr.name AS provider_name, pr.slug AS provider_slug \
             FROM packages p JOIN providers pr ON pr.id = p.provider_id WHERE p.is_active",
        );
        push_filters(&mut qb, filter);
        qb.push(" ORDER BY p.updated_at DESC, p.name LIMIT ")
            .push_bind(i64::from(filter.page_size()))
            .push(" OFFSET ")
            .push_bind(filter.offset() as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;

        let ids: Vec<Uuid> = rows
            .iter()
            .map(|row| row.try_get("id"))
            .collect::<Result<_, sqlx::Error>>()?;
        let mut countries_by_package: HashMap<Uuid, Vec<CountryBrief>> = HashMap::new();
        if !ids.is_empty() {
            let links = sqlx::query(
                "SELECT pc.package_id, c.code, c.name FROM package_countries pc \
                 JOIN countries c ON c.id = pc.country_id \
                 WHERE pc.package_id = ANY($1) ORDER BY c.name",
            )
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
            for link in &links {
                countries_by_package
                    .entry(link.try_get("package_id")?)
                    .or_default()
                    .push(CountryBrief {
                        code: link.try_get("code")?,
                        name: link.try_get("name")?,
                    });
            }
        }

        let packages = rows
            .iter()
            .map(|row| {
                let id: Uuid = row.try_get("id")?;
                let data = DataAllowance::from_column(row.try_get("data_amount_mb")?);
                let price: Decimal = row.try_get("price")?;
                Ok(PackageListing {
                    id,
                    name: row.try_get("name")?,
                    formatted_name: None,
                    provider: ProviderRef {
                        name: row.try_get("provider_name")?,
                        slug: row.try_get("provider_slug")?,
                    },
                    price,
                    data_amount_mb: data.to_column(),
                    data_amount_gb: data.gigabytes(),
                    validity_days: row.try_get("validity_days")?,
                    countries: countries_by_package.remove(&id).unwrap_or_default(),
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(PackagePage {
            packages,
            pagination: Pagination::new(filter.page(), filter.page_size(), total),
        })
    }

    async fn stats(&self) -> Result<CatalogStats, StoreError> {
        let general = sqlx::query(
            "SELECT \
               (SELECT COUNT(*) FROM packages) AS total_packages, \
               (SELECT COUNT(*) FROM packages WHERE is_active) AS active_packages, \
               (SELECT COUNT(*) FROM providers) AS total_providers, \
               (SELECT COUNT(*) FROM countries) AS total_countries",
        )
        .fetch_one(&self.pool)
        .await?;
        let total = count(&general, "total_packages")?;
        let active = count(&general, "active_packages")?;

        let provider_rows = sqlx::query(
            "SELECT pr.name, pr.slug, COUNT(p.id) AS total, \
                    COUNT(p.id) FILTER (WHERE p.is_active) AS active \
             FROM providers pr LEFT JOIN packages p ON p.provider_id = pr.id \
             GROUP BY pr.id, pr.name, pr.slug ORDER BY pr.name",
        )
        .fetch_all(&self.pool)
        .await?;
        let providers = provider_rows
            .iter()
            .map(|row| {
                let total = count(row, "total")?;
                let active = count(row, "active")?;
                Ok(ProviderStats {
                    name: row.try_get("name")?,
                    slug: row.try_get("slug")?,
                    total_packages: total,
                    active_packages: active,
                    inactive_packages: total.saturating_sub(active),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let country_rows = sqlx::query(
            "SELECT c.code, c.name, COUNT(*) AS package_count \
             FROM countries c \
             JOIN package_countries pc ON pc.country_id = c.id \
             JOIN packages p ON p.id = pc.package_id \
             WHERE p.is_active \
             GROUP BY c.id, c.code, c.name \
             ORDER BY package_count DESC, c.code \
             LIMIT $1",
        )
        .bind(TOP_COUNTRIES as i64)
        .fetch_all(&self.pool)
        .await?;
        let top_countries = country_rows
            .iter()
            .map(|row| {
                Ok(CountryStats {
                    code: row.try_get("code")?,
                    name: row.try_get("name")?,
                    package_count: count(row, "package_count")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(CatalogStats {
            general: GeneralStats {
                total_packages: total,
                active_packages: active,
                inactive_packages: total.saturating_sub(active),
                total_providers: count(&general, "total_providers")?,
                total_countries: count(&general, "total_countries")?,
            },
            providers,
            top_countries,
        })
    }

    async fn countries(&self, provider_slug: Option<&str>) -> Result<Vec<Country>, StoreError> {
        let rows = match provider_slug {
            None => {
                let sql = format!("SELECT {COUNTRY_COLUMNS} FROM countries ORDER BY name, code");
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
            Some(slug) => {
                sqlx::query(
                    "SELECT DISTINCT c.id, c.code, c.name, c.flag, c.is_active, c.is_regional, \
                            c.is_global \
                     FROM countries c \
                     JOIN package_countries pc ON pc.country_id = c.id \
                     JOIN packages p ON p.id = pc.package_id \
                     JOIN providers pr ON pr.id = p.provider_id \
                     WHERE pr.slug = $1 AND p.is_active \
                     ORDER BY c.name, c.code",
                )
                .bind(slug)
                .fetch_all(&self.pool)
                .await?
            }
        };
        let countries = rows
            .iter()
            .map(country_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(countries)
    }
}

/// Unique index matching the identity; names compare case-insensitively.
fn conflict_target(identity: &PackageIdentity) -> &'static str {
    match identity {
        PackageIdentity::External(_) => {
            "(provider_id, external_id) WHERE external_id IS NOT NULL"
        }
        PackageIdentity::Name(_) => "(provider_id, lower(name)) WHERE external_id IS NULL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_for(filter: &PackageFilter) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM packages p WHERE p.is_active");
        push_filters(&mut qb, filter);
        qb.sql().to_string()
    }

    #[test]
    fn unfiltered_search_adds_no_predicates() {
        assert_eq!(
            sql_for(&PackageFilter::default()),
            "SELECT 1 FROM packages p WHERE p.is_active"
        );
    }

    #[test]
    fn data_bounds_treat_unlimited_as_infinite() {
        let sql = sql_for(&PackageFilter {
            min_data: Some(1024),
            max_data: Some(5120),
            ..Default::default()
        });
        assert!(sql.contains("p.data_amount_mb = -1 OR p.data_amount_mb >= $1"));
        assert!(sql.contains("p.data_amount_mb <> -1 AND p.data_amount_mb <= $2"));
    }

    #[test]
    fn like_wildcards_in_search_terms_are_escaped() {
        assert_eq!(escape_like("100%_off"), "100\\%\\_off");
    }

    #[test]
    fn name_identity_conflicts_on_lowercased_name() {
        let identity = PackageIdentity::Name("Turkey 1GB".into());
        assert_eq!(
            conflict_target(&identity),
            "(provider_id, lower(name)) WHERE external_id IS NULL"
        );
        let identity = PackageIdentity::External("x-1".into());
        assert!(conflict_target(&identity).starts_with("(provider_id, external_id)"));
    }
}
