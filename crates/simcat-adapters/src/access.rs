use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use simcat_core::{DataAllowance, NormalizedPackage, ProviderSeed};
use simcat_storage::{HttpFetcher, JsonRequest};
use tracing::{debug, info, warn};

use crate::{
    allowance_from_volume, first_text, megabytes_from_token, package_name, price_from_cents,
    records_at, validity_days, AdapterError, CountrySet, ProviderAdapter, RawRecord, VolumeUnit,
};

pub const ESIMACCESS_SLUG: &str = "esimaccess";

#[derive(Debug, Clone)]
pub struct EsimAccessConfig {
    pub base_url: String,
    /// Prefix for the relative flag image paths in `locationLogo`.
    pub asset_base_url: String,
    pub access_code: String,
}

/// eSIM Access: one unpaged `POST /package/list`, optionally narrowed by `locationCode`.
#[derive(Debug, Clone)]
pub struct EsimAccessAdapter {
    config: EsimAccessConfig,
}

impl EsimAccessAdapter {
    pub fn new(config: EsimAccessConfig) -> Self {
        Self { config }
    }

    async fn list_packages(&self, http: &HttpFetcher, body: JsonValue) -> Vec<RawRecord> {
        let url = format!("{}/package/list", self.config.base_url.trim_end_matches('/'));
        let headers = [("RT-AccessCode", self.config.access_code.as_str())];
        let response = match http
            .fetch_json(ESIMACCESS_SLUG, JsonRequest::post(&url, &body).headers(&headers))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    provider = ESIMACCESS_SLUG,
                    %url,
                    error = %err,
                    "package list request failed"
                );
                return Vec::new();
            }
        };

        if response.get("success").and_then(JsonValue::as_bool) == Some(false) {
            let message = first_text(&response, &["errorMsg", "errorCode"]).unwrap_or_default();
            warn!(
                provider = ESIMACCESS_SLUG,
                %url,
                %message,
                "provider returned an error envelope"
            );
            return Vec::new();
        }

        match records_at(&response, "/obj/packageList") {
            Some(records) => {
                debug!(provider = ESIMACCESS_SLUG, count = records.len(), "package list fetched");
                records.clone()
            }
            None => {
                warn!(
                    provider = ESIMACCESS_SLUG,
                    %url,
                    body = %response,
                    "unexpected package list shape"
                );
                Vec::new()
            }
        }
    }

    fn countries(&self, raw: &JsonValue) -> CountrySet {
        let mut set = CountrySet::new();
        let asset_base = self.config.asset_base_url.trim_end_matches('/');
        for network in raw
            .get("locationNetworkList")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
        {
            let Some(code) = first_text(network, &["locationCode"]) else {
                continue;
            };
            let flag = first_text(network, &["locationLogo"]).map(|logo| {
                if logo.starts_with("http") {
                    logo
                } else {
                    format!("{asset_base}/{}", logo.trim_start_matches('/'))
                }
            });
            let name = first_text(network, &["locationName"]);
            set.add(&code, name.as_deref(), flag);
        }
        set.extend_from(raw.get("location"));
        set.extend_from(raw.get("country_codes"));
        set
    }
}

#[async_trait]
impl ProviderAdapter for EsimAccessAdapter {
    fn slug(&self) -> &'static str {
        ESIMACCESS_SLUG
    }

    fn descriptor(&self) -> ProviderSeed {
        ProviderSeed {
            slug: ESIMACCESS_SLUG.to_string(),
            name: "eSIM Access".to_string(),
            credential: self.config.access_code.clone(),
        }
    }

    async fn fetch_all(&self, http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError> {
        info!(provider = ESIMACCESS_SLUG, "fetching full catalog");
        Ok(self.list_packages(http, json!({})).await)
    }

    async fn fetch_for_country(
        &self,
        http: &HttpFetcher,
        country_code: &str,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        info!(provider = ESIMACCESS_SLUG, country = country_code, "fetching country catalog");
        let records = self
            .list_packages(http, json!({ "locationCode": country_code }))
            .await;
        // The server-side filter also returns multi-country bundles; keep exact code matches.
        Ok(records
            .into_iter()
            .filter(|raw| self.countries(raw).contains(country_code))
            .collect())
    }

    fn normalize(&self, raw: &RawRecord) -> Result<NormalizedPackage, AdapterError> {
        if !raw.is_object() {
            return Err(AdapterError::malformed("record", format!("expected an object, got {raw}")));
        }

        let data = allowance_from_volume(raw.get("volume"), VolumeUnit::Bytes)
            .filter(|d| d.is_usable())
            .unwrap_or_else(|| {
                DataAllowance::Megabytes(
                    first_text(raw, &["data"])
                        .map(|token| megabytes_from_token(&token))
                        .unwrap_or(0),
                )
            });

        Ok(NormalizedPackage {
            external_id: first_text(raw, &["packageCode"]),
            name: package_name(raw, &["name"]),
            price: price_from_cents(raw.get("price"))?,
            validity_days: validity_days(raw, &["duration"])?,
            data,
            countries: self.countries(raw).into_vec(),
            detail: raw.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use simcat_storage::{BackoffPolicy, HttpClientConfig};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: &str) -> EsimAccessAdapter {
        EsimAccessAdapter::new(EsimAccessConfig {
            base_url: base_url.to_string(),
            asset_base_url: "https://static.example.com".to_string(),
            access_code: "code-123".to_string(),
        })
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            ..HttpClientConfig::default()
        })
        .expect("client")
    }

    fn turkey_bundle() -> JsonValue {
        json!({
            "packageCode": "CKH491",
            "name": "TR 1GB 7Days",
            "price": 450,
            "volume": 1073741824u64,
            "duration": 7,
            "durationUnit": "DAY",
            "location": "TR",
            "locationNetworkList": [
                {"locationCode": "TR", "locationName": "Turkey", "locationLogo": "/img/flags/tr.png"}
            ]
        })
    }

    #[test]
    fn normalizes_cents_bytes_and_network_list() {
        let pkg = adapter("http://unused").normalize(&turkey_bundle()).expect("normalize");
        assert_eq!(pkg.external_id.as_deref(), Some("CKH491"));
        assert_eq!(pkg.price, dec!(4.50));
        assert_eq!(pkg.data, DataAllowance::Megabytes(1024));
        assert_eq!(pkg.validity_days, 7);
        assert_eq!(pkg.countries.len(), 1);
        assert_eq!(pkg.countries[0].name.as_deref(), Some("Turkey"));
        assert_eq!(
            pkg.countries[0].flag.as_deref(),
            Some("https://static.example.com/img/flags/tr.png")
        );
    }

    #[test]
    fn falls_back_to_text_volume_and_placeholder_name() {
        let raw = json!({"data": "2GB", "duration": 30, "price": 1000, "location": "US,CA"});
        let pkg = adapter("http://unused").normalize(&raw).expect("normalize");
        assert_eq!(pkg.data, DataAllowance::Megabytes(2048));
        assert_eq!(pkg.name, simcat_core::UNNAMED_PACKAGE);
        assert_eq!(pkg.external_id, None);
        assert_eq!(pkg.country_codes().into_iter().collect::<Vec<_>>(), vec!["CA", "US"]);
    }

    #[test]
    fn unlimited_volume_sentinel_is_kept() {
        let raw = json!({"name": "Global Unlimited", "volume": -1, "duration": 1, "price": 900});
        let pkg = adapter("http://unused").normalize(&raw).expect("normalize");
        assert_eq!(pkg.data, DataAllowance::Unlimited);
    }

    #[tokio::test]
    async fn fetch_for_country_posts_location_and_keeps_exact_matches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/package/list"))
            .and(header("RT-AccessCode", "code-123"))
            .and(body_json(json!({"locationCode": "TR"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "obj": {"packageList": [
                    turkey_bundle(),
                    {"packageCode": "EU-1", "name": "Europe 5GB 30Days", "location": "DE,FR"}
                ]}
            })))
            .mount(&server)
            .await;

        let records = adapter(&server.uri())
            .fetch_for_country(&http(), "TR")
            .await
            .expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["packageCode"], "CKH491");
    }

    #[tokio::test]
    async fn error_envelope_yields_no_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "errorCode": "000101",
                "errorMsg": "access code invalid"
            })))
            .mount(&server)
            .await;

        let records = adapter(&server.uri()).fetch_all(&http()).await.expect("fetch");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_yields_no_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let records = adapter(&server.uri()).fetch_all(&http()).await.expect("fetch");
        assert!(records.is_empty());
    }
}
