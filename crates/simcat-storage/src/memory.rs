use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use simcat_core::{
    CatalogStats, Country, CountryBrief, CountryRef, CountryStats, GeneralStats,
    NormalizedPackage, Package, PackageFilter, PackageIdentity, PackageListing, PackagePage,
    PackageSummary, Pagination, Provider, ProviderRef, ProviderSeed, ProviderStats, StalePackage,
    UpsertOutcome, TOP_COUNTRIES,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{CatalogStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    providers: BTreeMap<Uuid, Provider>,
    countries: BTreeMap<Uuid, Country>,
    packages: BTreeMap<Uuid, Package>,
    links: BTreeMap<Uuid, BTreeSet<Uuid>>,
}

impl MemoryState {
    fn find_package(&self, provider_id: Uuid, identity: &PackageIdentity) -> Option<Uuid> {
        self.packages
            .values()
            .find(|p| {
                p.provider_id == provider_id
                    && match identity {
                        PackageIdentity::External(id) => {
                            p.external_id.as_deref() == Some(id.as_str())
                        }
                        PackageIdentity::Name(name) => {
                            p.external_id.is_none() && p.name.to_lowercase() == name.to_lowercase()
                        }
                    }
            })
            .map(|p| p.id)
    }

    fn package_countries(&self, package_id: Uuid) -> impl Iterator<Item = &Country> {
        self.links
            .get(&package_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.countries.get(id))
    }

    fn provider_name(&self, provider_id: Uuid) -> String {
        self.providers
            .get(&provider_id)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }
}

/// Process-local [`CatalogStore`] used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites a package's `updated_at`, for exercising retention windows.
    pub async fn backdate(&self, package_id: Uuid, updated_at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        match state.packages.get_mut(&package_id) {
            Some(pkg) => {
                pkg.updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    pub async fn package_count(&self) -> usize {
        self.state.lock().await.packages.len()
    }
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

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn get_or_create_provider(&self, seed: &ProviderSeed) -> Result<Provider, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.providers.values().find(|p| p.slug == seed.slug) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let provider = Provider {
            id: Uuid::new_v4(),
            slug: seed.slug.clone(),
            name: seed.name.clone(),
            credential: seed.credential.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        state.providers.insert(provider.id, provider.clone());
        Ok(provider)
    }

    async fn provider_by_slug(&self, slug: &str) -> Result<Option<Provider>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.providers.values().find(|p| p.slug == slug).cloned())
    }

    async fn resolve_or_create_country(&self, country: &CountryRef) -> Result<Country, StoreError> {
        let code = normalize_code(&country.code)?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.countries.values_mut().find(|c| c.code == code) {
            if existing.name == existing.code {
                if let Some(name) = country.name.as_deref().filter(|n| !n.trim().is_empty()) {
                    existing.name = name.trim().to_string();
                }
            }
            if existing.flag.is_empty() {
                if let Some(flag) = &country.flag {
                    existing.flag = flag.clone();
                }
            }
            return Ok(existing.clone());
        }

        let created = Country {
            id: Uuid::new_v4(),
            name: country
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(code.as_str())
                .to_string(),
            flag: country.flag.clone().unwrap_or_default(),
            code,
            is_active: true,
            is_regional: false,
            is_global: false,
        };
        state.countries.insert(created.id, created.clone());
        Ok(created)
    }

    async fn upsert_package(
        &self,
        provider_id: Uuid,
        package: &NormalizedPackage,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if !state.providers.contains_key(&provider_id) {
            return Err(StoreError::NotFound {
                entity: "provider",
                key: provider_id.to_string(),
            });
        }

        let identity = package.identity();
        let now = Utc::now();
        if let Some(id) = state.find_package(provider_id, &identity) {
            if let Some(existing) = state.packages.get_mut(&id) {
                existing.name = package.name.clone();
                existing.price = package.price;
                existing.validity_days = package.validity_days;
                existing.data = package.data;
                existing.detail = package.detail.clone();
                existing.is_active = true;
                existing.updated_at = now;
            }
            return Ok(UpsertOutcome {
                package_id: id,
                created: false,
            });
        }

        let external_id = match identity {
            PackageIdentity::External(id) => Some(id),
            PackageIdentity::Name(_) => None,
        };
        let created = Package {
            id: Uuid::new_v4(),
            provider_id,
            external_id,
            name: package.name.clone(),
            price: package.price,
            validity_days: package.validity_days,
            data: package.data,
            detail: package.detail.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let package_id = created.id;
        state.packages.insert(package_id, created);
        Ok(UpsertOutcome {
            package_id,
            created: true,
        })
    }

    async fn set_package_countries(
        &self,
        package_id: Uuid,
        country_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.packages.contains_key(&package_id) {
            return Err(StoreError::NotFound {
                entity: "package",
                key: package_id.to_string(),
            });
        }
        if let Some(missing) = country_ids.iter().find(|id| !state.countries.contains_key(id)) {
            return Err(StoreError::NotFound {
                entity: "country",
                key: missing.to_string(),
            });
        }
        state
            .links
            .insert(package_id, country_ids.iter().copied().collect());
        Ok(())
    }

    async fn package_country_codes(&self, package_id: Uuid) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let mut codes: Vec<String> = state
            .package_countries(package_id)
            .map(|c| c.code.clone())
            .collect();
        codes.sort();
        Ok(codes)
    }

    async fn get_package(&self, package_id: Uuid) -> Result<Option<Package>, StoreError> {
        Ok(self.state.lock().await.packages.get(&package_id).cloned())
    }

    async fn deactivate_for_country(
        &self,
        provider_id: Uuid,
        country_code: &str,
    ) -> Result<u64, StoreError> {
        let code = normalize_code(country_code)?;
        let mut state = self.state.lock().await;
        let Some(country_id) = state
            .countries
            .values()
            .find(|c| c.code == code)
            .map(|c| c.id)
        else {
            return Ok(0);
        };

        let targets: Vec<Uuid> = state
            .packages
            .values()
            .filter(|p| p.provider_id == provider_id && p.is_active)
            .filter(|p| state.links.get(&p.id).is_some_and(|l| l.contains(&country_id)))
            .map(|p| p.id)
            .collect();

        let now = Utc::now();
        for id in &targets {
            if let Some(pkg) = state.packages.get_mut(id) {
                pkg.is_active = false;
                pkg.updated_at = now;
            }
        }
        Ok(targets.len() as u64)
    }

    async fn deactivate_provider(&self, provider_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut count = 0;
        for pkg in state
            .packages
            .values_mut()
            .filter(|p| p.provider_id == provider_id && p.is_active)
        {
            pkg.is_active = false;
            pkg.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<StalePackage>, StoreError> {
        let state = self.state.lock().await;
        let mut stale: Vec<StalePackage> = state
            .packages
            .values()
            .filter(|p| !p.is_active && p.updated_at < cutoff)
            .map(|p| StalePackage {
                id: p.id,
                name: p.name.clone(),
                provider_name: state.provider_name(p.provider_id),
                updated_at: p.updated_at,
            })
            .collect();
        stale.sort_by_key(|p| p.updated_at);
        Ok(stale)
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .packages
            .values()
            .filter(|p| !p.is_active && p.updated_at < cutoff)
            .map(|p| p.id)
            .collect();
        for id in &doomed {
            state.packages.remove(id);
            state.links.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn active_packages(&self) -> Result<Vec<PackageSummary>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .packages
            .values()
            .filter(|p| p.is_active)
            .map(|p| PackageSummary {
                id: p.id,
                name: p.name.clone(),
                provider_name: state.provider_name(p.provider_id),
                price: p.price,
                validity_days: p.validity_days,
                data: p.data,
                country_count: state.links.get(&p.id).map_or(0, BTreeSet::len),
            })
            .collect())
    }

    async fn search(&self, filter: &PackageFilter) -> Result<PackagePage, StoreError> {
        let state = self.state.lock().await;
        let country = filter
            .country
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let provider = filter
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());

        let mut matches: Vec<&Package> = state
            .packages
            .values()
            .filter(|p| p.is_active)
            .filter(|p| {
                provider.map_or(true, |slug| {
                    state
                        .providers
                        .get(&p.provider_id)
                        .is_some_and(|pr| pr.slug == slug)
                })
            })
            .filter(|p| {
                country.map_or(true, |code| {
                    state
                        .package_countries(p.id)
                        .any(|c| c.code.eq_ignore_ascii_case(code))
                })
            })
            .filter(|p| filter.accepts_price(p.price))
            .filter(|p| filter.accepts_data(p.data))
            .filter(|p| filter.accepts_validity(p.validity_days))
            .filter(|p| filter.accepts_name(&p.name))
            .collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.name.cmp(&b.name)));

        let total = matches.len() as u64;
        let packages = matches
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.page_size() as usize)
            .map(|p| {
                let provider = state.providers.get(&p.provider_id);
                let mut countries: Vec<CountryBrief> = state
                    .package_countries(p.id)
                    .map(|c| CountryBrief {
                        code: c.code.clone(),
                        name: c.name.clone(),
                    })
                    .collect();
                countries.sort_by(|a, b| a.name.cmp(&b.name));
                PackageListing {
                    id: p.id,
                    name: p.name.clone(),
                    formatted_name: None,
                    provider: ProviderRef {
                        name: provider.map(|pr| pr.name.clone()).unwrap_or_default(),
                        slug: provider.map(|pr| pr.slug.clone()).unwrap_or_default(),
                    },
                    price: p.price,
                    data_amount_mb: p.data.to_column(),
                    data_amount_gb: p.data.gigabytes(),
                    validity_days: p.validity_days,
                    countries,
                    created_at: p.created_at,
                    updated_at: p.updated_at,
                }
            })
            .collect();

        Ok(PackagePage {
            packages,
            pagination: Pagination::new(filter.page(), filter.page_size(), total),
        })
    }

    async fn stats(&self) -> Result<CatalogStats, StoreError> {
        let state = self.state.lock().await;
        let total = state.packages.len() as u64;
        let active = state.packages.values().filter(|p| p.is_active).count() as u64;

        let mut providers: Vec<ProviderStats> = state
            .providers
            .values()
            .map(|pr| {
                let owned = state.packages.values().filter(|p| p.provider_id == pr.id);
                let total = owned.clone().count() as u64;
                let active = owned.filter(|p| p.is_active).count() as u64;
                ProviderStats {
                    name: pr.name.clone(),
                    slug: pr.slug.clone(),
                    total_packages: total,
                    active_packages: active,
                    inactive_packages: total - active,
                }
            })
            .collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));

        let mut per_country: HashMap<Uuid, u64> = HashMap::new();
        for pkg in state.packages.values().filter(|p| p.is_active) {
            for country_id in state.links.get(&pkg.id).into_iter().flatten() {
                *per_country.entry(*country_id).or_default() += 1;
            }
        }
        let mut top_countries: Vec<CountryStats> = per_country
            .into_iter()
            .filter_map(|(id, count)| {
                state.countries.get(&id).map(|c| CountryStats {
                    code: c.code.clone(),
                    name: c.name.clone(),
                    package_count: count,
                })
            })
            .collect();
        top_countries.sort_by(|a, b| {
            b.package_count
                .cmp(&a.package_count)
                .then_with(|| a.code.cmp(&b.code))
        });
        top_countries.truncate(TOP_COUNTRIES);

        Ok(CatalogStats {
            general: GeneralStats {
                total_packages: total,
                active_packages: active,
                inactive_packages: total - active,
                total_providers: state.providers.len() as u64,
                total_countries: state.countries.len() as u64,
            },
            providers,
            top_countries,
        })
    }

    async fn countries(&self, provider_slug: Option<&str>) -> Result<Vec<Country>, StoreError> {
        let state = self.state.lock().await;
        let mut countries: Vec<Country> = match provider_slug {
            None => state.countries.values().cloned().collect(),
            Some(slug) => {
                let Some(provider) = state.providers.values().find(|p| p.slug == slug) else {
                    return Ok(Vec::new());
                };
                let ids: BTreeSet<Uuid> = state
                    .packages
                    .values()
                    .filter(|p| p.provider_id == provider.id && p.is_active)
                    .flat_map(|p| state.links.get(&p.id).into_iter().flatten().copied())
                    .collect();
                ids.iter()
                    .filter_map(|id| state.countries.get(id).cloned())
                    .collect()
            }
        };
        countries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.code.cmp(&b.code)));
        Ok(countries)
    }
}
