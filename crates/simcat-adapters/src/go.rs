use async_trait::async_trait;
use serde_json::Value as JsonValue;
use simcat_core::{CountryRef, DataAllowance, NormalizedPackage, ProviderSeed};
use simcat_storage::{HttpFetcher, JsonRequest};
use tracing::{debug, info, warn};

use crate::{
    allowance_from_volume, first_text, megabytes_from_token, package_name, price_from_decimal,
    records_at, validity_days, AdapterError, CountrySet, ProviderAdapter, RawRecord, VolumeUnit,
};

pub const ESIMGO_SLUG: &str = "esimgo";

/// Hard stop for catalogs that never return a short page.
const MAX_PAGES: u32 = 500;

#[derive(Debug, Clone)]
pub struct EsimGoConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_size: u32,
}

/// eSIM Go: paged `GET /catalogue`, country coverage matched client-side.
#[derive(Debug, Clone)]
pub struct EsimGoAdapter {
    config: EsimGoConfig,
    max_pages: u32,
}

impl EsimGoAdapter {
    pub fn new(config: EsimGoConfig) -> Self {
        Self {
            config,
            max_pages: MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.config.base_url.trim_end_matches('/'))
    }

    /// Pages until an empty or short page. A failed page ends the walk but
    /// keeps what earlier pages returned.
    async fn fetch_pages(
        &self,
        http: &HttpFetcher,
        country_code: Option<&str>,
    ) -> Vec<RawRecord> {
        let url = self.url("catalogue");
        let headers = [("X-API-Key", self.config.api_key.as_str())];
        let page_size = self.config.page_size.max(1);
        let mut bundles = Vec::new();

        for page in 1..=self.max_pages {
            let mut query = vec![
                ("page", page.to_string()),
                ("pageSize", page_size.to_string()),
            ];
            if let Some(code) = country_code {
                query.push(("countries", code.to_string()));
            }

            let response = match http
                .fetch_json(
                    ESIMGO_SLUG,
                    JsonRequest::get(&url).headers(&headers).query(&query),
                )
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        provider = ESIMGO_SLUG,
                        %url,
                        page,
                        error = %err,
                        "catalogue page request failed"
                    );
                    break;
                }
            };

            let Some(records) = records_at(&response, "/bundles") else {
                warn!(
                    provider = ESIMGO_SLUG,
                    %url,
                    page,
                    body = %response,
                    "unexpected catalogue shape"
                );
                break;
            };
            if records.is_empty() {
                break;
            }

            debug!(provider = ESIMGO_SLUG, page, count = records.len(), "catalogue page fetched");
            bundles.extend(records.iter().cloned());
            if records.len() < page_size as usize {
                break;
            }
            if page == self.max_pages {
                warn!(
                    provider = ESIMGO_SLUG,
                    max_pages = self.max_pages,
                    fetched = bundles.len(),
                    "catalogue page limit reached; remaining pages not fetched"
                );
            }
        }
        bundles
    }

    fn countries(raw: &JsonValue) -> CountrySet {
        let mut set = CountrySet::new();
        set.extend_from(raw.get("countries"));
        set.extend_from(raw.get("coverage"));
        set.extend_from(raw.get("country_codes"));
        set
    }
}

#[async_trait]
impl ProviderAdapter for EsimGoAdapter {
    fn slug(&self) -> &'static str {
        ESIMGO_SLUG
    }

    fn descriptor(&self) -> ProviderSeed {
        ProviderSeed {
            slug: ESIMGO_SLUG.to_string(),
            name: "eSIM Go".to_string(),
            credential: self.config.api_key.clone(),
        }
    }

    async fn fetch_all(&self, http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError> {
        info!(provider = ESIMGO_SLUG, "fetching full catalogue");
        Ok(self.fetch_pages(http, None).await)
    }

    async fn fetch_for_country(
        &self,
        http: &HttpFetcher,
        country_code: &str,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        info!(provider = ESIMGO_SLUG, country = country_code, "fetching country catalogue");
        let bundles = self.fetch_pages(http, Some(country_code)).await;
        let matching: Vec<RawRecord> = bundles
            .into_iter()
            .filter(|raw| Self::countries(raw).contains(country_code))
            .collect();
        if matching.is_empty() {
            warn!(provider = ESIMGO_SLUG, country = country_code, "no bundles cover country");
        }
        Ok(matching)
    }

    fn normalize(&self, raw: &RawRecord) -> Result<NormalizedPackage, AdapterError> {
        if !raw.is_object() {
            return Err(AdapterError::malformed("record", format!("expected an object, got {raw}")));
        }

        let data = if raw.get("unlimited").and_then(JsonValue::as_bool) == Some(true) {
            DataAllowance::Unlimited
        } else {
            allowance_from_volume(raw.get("dataAmount"), VolumeUnit::Megabytes).unwrap_or_else(|| {
                DataAllowance::Megabytes(
                    first_text(raw, &["data", "data_amount", "size"])
                        .map(|token| megabytes_from_token(&token))
                        .unwrap_or(0),
                )
            })
        };

        Ok(NormalizedPackage {
            external_id: first_text(raw, &["id", "external_id"]),
            name: package_name(raw, &["description", "title"]),
            price: price_from_decimal(raw.get("price"))?,
            validity_days: validity_days(raw, &["validity_days", "validity", "duration"])?,
            data,
            countries: Self::countries(raw).into_vec(),
            detail: raw.clone(),
        })
    }

    async fn remote_countries(&self, http: &HttpFetcher) -> Result<Vec<CountryRef>, AdapterError> {
        let url = self.url("countries");
        let headers = [("X-API-Key", self.config.api_key.as_str())];
        let response = match http
            .fetch_json(ESIMGO_SLUG, JsonRequest::get(&url).headers(&headers))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(provider = ESIMGO_SLUG, %url, error = %err, "country list request failed");
                return Ok(Vec::new());
            }
        };

        let mut set = CountrySet::new();
        match records_at(&response, "/countries") {
            Some(items) => set.extend_from(Some(&JsonValue::Array(items.clone()))),
            None => warn!(
                provider = ESIMGO_SLUG,
                %url,
                body = %response,
                "unexpected country list shape"
            ),
        }
        Ok(set.into_vec())
    }
}
