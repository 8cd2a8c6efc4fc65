//! Provider adapters: fetch a wholesale catalog and translate each raw record
//! into a [`NormalizedPackage`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use simcat_core::{
    CountryRef, DataAllowance, NormalizedPackage, ProviderSeed, UNLIMITED_DATA_MB, UNNAMED_PACKAGE,
};
use simcat_storage::{FetchError, HttpFetcher};
use thiserror::Error;

mod access;
mod go;

pub use access::{EsimAccessAdapter, EsimAccessConfig, ESIMACCESS_SLUG};
pub use go::{EsimGoAdapter, EsimGoConfig, ESIMGO_SLUG};

pub const CRATE_NAME: &str = "simcat-adapters";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A provider record exactly as the remote API returned it.
pub type RawRecord = JsonValue;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {field}: {message}")]
    Malformed { field: &'static str, message: String },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn malformed(field: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            field,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn slug(&self) -> &'static str;

    /// Provider row this adapter reconciles into.
    fn descriptor(&self) -> ProviderSeed;

    /// Every record in the remote catalog. Transport failures yield whatever
    /// was fetched before the failure, possibly nothing.
    async fn fetch_all(&self, http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError>;

    /// Records covering `country_code`, using the provider's own matching rule.
    async fn fetch_for_country(
        &self,
        http: &HttpFetcher,
        country_code: &str,
    ) -> Result<Vec<RawRecord>, AdapterError>;

    fn normalize(&self, raw: &RawRecord) -> Result<NormalizedPackage, AdapterError>;

    async fn remote_countries(&self, _http: &HttpFetcher) -> Result<Vec<CountryRef>, AdapterError> {
        Ok(Vec::new())
    }
}

/// Explicit slug-to-adapter map handed to the orchestrator.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.slugs())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the adapters whose credentials are configured.
    pub fn from_configs(access: Option<EsimAccessConfig>, go: Option<EsimGoConfig>) -> Self {
        let mut registry = Self::new();
        if let Some(config) = access {
            registry.register(Arc::new(EsimAccessAdapter::new(config)));
        }
        if let Some(config) = go {
            registry.register(Arc::new(EsimGoAdapter::new(config)));
        }
        registry
    }

    /// Adds an adapter, replacing any previous one with the same slug.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.retain(|existing| existing.slug() != adapter.slug());
        self.adapters.push(adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| a.slug() == slug).cloned()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.adapters.iter()
    }

    pub fn slugs(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.slug()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Short display name in the provider's own naming scheme, `"<country>,<validity>/<data>"`.
/// Names that do not follow the scheme are returned unchanged.
pub fn format_package_name(provider_slug: &str, name: &str) -> String {
    match provider_slug {
        // "TR 1GB 7Days"
        ESIMACCESS_SLUG => {
            let parts: Vec<&str> = name.split(' ').collect();
            match parts.as_slice() {
                [country, data, validity] => format!("{country},{validity}/{data}"),
                _ => name.to_string(),
            }
        }
        // "eSIM, 1GB, 7 Days, Turkey, V2"
        ESIMGO_SLUG => {
            let parts: Vec<&str> = name.split(", ").collect();
            if parts.len() >= 5 {
                format!("{},{}/{}", parts[3], parts[2], parts[1])
            } else {
                name.to_string()
            }
        }
        _ => name.to_string(),
    }
}

/// First non-empty string (or number rendered as text) among `keys`.
pub fn first_text(raw: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match raw.get(*key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn package_name(raw: &JsonValue, keys: &[&str]) -> String {
    first_text(raw, keys).unwrap_or_else(|| UNNAMED_PACKAGE.to_string())
}

pub fn megabytes_from_bytes(bytes: f64) -> u64 {
    if bytes <= 0.0 {
        0
    } else {
        (bytes / BYTES_PER_MB).floor() as u64
    }
}

/// Parses `"2GB"` / `"500MB"` style tokens. Anything else is zero.
pub fn megabytes_from_token(token: &str) -> u64 {
    let token = token.trim().to_uppercase();
    let (number, factor) = if let Some(n) = token.strip_suffix("GB") {
        (n, 1024.0)
    } else if let Some(n) = token.strip_suffix("MB") {
        (n, 1.0)
    } else {
        return 0;
    };
    match number.trim().parse::<f64>() {
        Ok(value) if value > 0.0 => (value * factor) as u64,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeUnit {
    Bytes,
    Megabytes,
}

/// Reads a numeric volume field. `None` when the field is absent or not a number.
pub fn allowance_from_volume(value: Option<&JsonValue>, unit: VolumeUnit) -> Option<DataAllowance> {
    let amount = value?.as_f64()?;
    if amount == UNLIMITED_DATA_MB as f64 {
        return Some(DataAllowance::Unlimited);
    }
    let mb = match unit {
        VolumeUnit::Bytes => megabytes_from_bytes(amount),
        VolumeUnit::Megabytes if amount > 0.0 => amount as u64,
        VolumeUnit::Megabytes => 0,
    };
    Some(DataAllowance::Megabytes(mb))
}

/// Integer minor units, e.g. `450` is `4.50`. Missing is zero.
pub fn price_from_cents(value: Option<&JsonValue>) -> Result<Decimal, AdapterError> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(Decimal::ZERO);
    };
    let cents = match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        AdapterError::malformed("price", format!("expected integer cents, got {value}"))
    })?;
    Ok(Decimal::new(cents, 2))
}

/// Decimal amount given as a JSON number or a decimal string. Missing is zero.
pub fn price_from_decimal(value: Option<&JsonValue>) -> Result<Decimal, AdapterError> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(Decimal::ZERO);
    };
    let parsed = match value {
        JsonValue::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text)).ok()
        }
        JsonValue::String(s) if s.trim().is_empty() => Some(Decimal::ZERO),
        JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        AdapterError::malformed("price", format!("expected a decimal, got {value}"))
    })
}

/// Day count from the first present key among `keys`. Missing is zero.
pub fn validity_days(raw: &JsonValue, keys: &[&str]) -> Result<i32, AdapterError> {
    let Some(value) = keys
        .iter()
        .filter_map(|key| raw.get(*key))
        .find(|v| !v.is_null())
    else {
        return Ok(0);
    };
    let days = match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    days.and_then(|d| i32::try_from(d).ok()).ok_or_else(|| {
        AdapterError::malformed("validity", format!("expected a day count, got {value}"))
    })
}

/// Union of country codes gathered from differently shaped payload fields.
#[derive(Debug, Default)]
pub struct CountrySet {
    by_code: BTreeMap<String, CountryRef>,
}

impl CountrySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, code: &str, name: Option<&str>, flag: Option<String>) {
        let code = code.trim().to_uppercase();
        if code.is_empty() {
            return;
        }
        let entry = self
            .by_code
            .entry(code.clone())
            .or_insert_with(|| CountryRef::code(code));
        if entry.name.is_none() {
            entry.name = name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
        }
        if entry.flag.is_none() {
            entry.flag = flag.filter(|f| !f.is_empty());
        }
    }

    /// Accepts a list of codes, a list of objects carrying an ISO field,
    /// or a comma-separated string.
    pub fn extend_from(&mut self, value: Option<&JsonValue>) {
        match value {
            Some(JsonValue::Array(items)) => {
                for item in items {
                    match item {
                        JsonValue::String(code) => self.add(code, None, None),
                        JsonValue::Object(_) => {
                            if let Some(code) = first_text(item, &["iso", "locationCode", "code"]) {
                                let name = first_text(item, &["name", "locationName"]);
                                self.add(&code, name.as_deref(), None);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some(JsonValue::String(list)) => {
                for code in list.split(',') {
                    self.add(code, None, None);
                }
            }
            _ => {}
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.by_code.contains_key(&code.trim().to_uppercase())
    }

    pub fn into_vec(self) -> Vec<CountryRef> {
        self.by_code.into_values().collect()
    }
}

/// Records out of a JSON response, tolerating a bare list or a wrapped one.
pub(crate) fn records_at<'a>(body: &'a JsonValue, pointer: &str) -> Option<&'a Vec<JsonValue>> {
    match body {
        JsonValue::Array(items) => Some(items),
        other => other.pointer(pointer)?.as_array(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn byte_volumes_and_text_tokens_convert_to_megabytes() {
        assert_eq!(megabytes_from_bytes(1_073_741_824.0), 1024);
        assert_eq!(megabytes_from_token("2GB"), 2048);
        assert_eq!(megabytes_from_token(" 500mb "), 500);
        assert_eq!(megabytes_from_token("1.5GB"), 1536);
        assert_eq!(megabytes_from_token("unlimited"), 0);
        assert_eq!(megabytes_from_token(""), 0);
    }

    #[test]
    fn only_the_explicit_sentinel_means_unlimited() {
        assert_eq!(
            allowance_from_volume(Some(&json!(-1)), VolumeUnit::Bytes),
            Some(DataAllowance::Unlimited)
        );
        assert_eq!(
            allowance_from_volume(Some(&json!(-5)), VolumeUnit::Megabytes),
            Some(DataAllowance::Megabytes(0))
        );
        assert_eq!(
            allowance_from_volume(Some(&json!(0)), VolumeUnit::Bytes),
            Some(DataAllowance::Megabytes(0))
        );
        assert_eq!(allowance_from_volume(None, VolumeUnit::Bytes), None);
        assert_eq!(allowance_from_volume(Some(&json!("1GB")), VolumeUnit::Bytes), None);
    }

    #[test]
    fn prices_parse_from_cents_and_decimal_strings() {
        assert_eq!(price_from_cents(Some(&json!(450))).unwrap(), dec!(4.50));
        assert_eq!(price_from_cents(None).unwrap(), Decimal::ZERO);
        assert!(price_from_cents(Some(&json!("4.5"))).is_err());

        assert_eq!(price_from_decimal(Some(&json!("12.99"))).unwrap(), dec!(12.99));
        assert_eq!(price_from_decimal(Some(&json!(3.5))).unwrap(), dec!(3.5));
        assert!(matches!(
            price_from_decimal(Some(&json!("twelve"))),
            Err(AdapterError::Malformed { field: "price", .. })
        ));
    }

    #[test]
    fn country_shapes_are_unioned_by_code() {
        let mut set = CountrySet::new();
        set.extend_from(Some(&json!(["tr", "US"])));
        set.extend_from(Some(&json!([{"iso": "TR", "name": "Turkey"}, {"iso": "DE"}])));
        set.extend_from(Some(&json!("US,FR")));
        let countries = set.into_vec();
        let codes: Vec<&str> = countries.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["DE", "FR", "TR", "US"]);
        assert_eq!(countries[2].name.as_deref(), Some("Turkey"));
    }

    #[test]
    fn validity_takes_first_present_key() {
        let raw = json!({"validity": "30", "duration": 7});
        assert_eq!(validity_days(&raw, &["validity_days", "validity", "duration"]).unwrap(), 30);
        assert_eq!(validity_days(&json!({}), &["duration"]).unwrap(), 0);
        assert!(validity_days(&json!({"duration": "a week"}), &["duration"]).is_err());
    }

    #[test]
    fn formatted_names_follow_each_provider_scheme() {
        assert_eq!(format_package_name(ESIMACCESS_SLUG, "TR 1GB 7Days"), "TR,7Days/1GB");
        assert_eq!(
            format_package_name(ESIMGO_SLUG, "eSIM, 1GB, 7 Days, Turkey, V2"),
            "Turkey,7 Days/1GB"
        );
        assert_eq!(
            format_package_name(ESIMACCESS_SLUG, "Europe 42 countries 5GB"),
            "Europe 42 countries 5GB"
        );
        assert_eq!(format_package_name("other", "Plan"), "Plan");
    }

    #[test]
    fn registry_replaces_adapters_by_slug() {
        let go = || {
            Arc::new(EsimGoAdapter::new(EsimGoConfig {
                base_url: "http://localhost".into(),
                api_key: "k".into(),
                page_size: 10,
            })) as Arc<dyn ProviderAdapter>
        };
        let registry = ProviderRegistry::new().with(go()).with(go());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(ESIMGO_SLUG).is_some());
        assert!(registry.get(ESIMACCESS_SLUG).is_none());
    }
}
