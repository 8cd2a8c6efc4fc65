//! Core catalog model shared by the adapters, the reconciler and the API.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "simcat-core";

/// Name given to packages whose provider did not supply one.
pub const UNNAMED_PACKAGE: &str = "Unnamed Package";

/// Column value used for unlimited data allowances.
pub const UNLIMITED_DATA_MB: i64 = -1;

/// Data allowance of a package after unit normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataAllowance {
    Megabytes(u64),
    Unlimited,
}

impl DataAllowance {
    pub fn from_column(mb: i64) -> Self {
        if mb == UNLIMITED_DATA_MB {
            Self::Unlimited
        } else {
            Self::Megabytes(mb.max(0) as u64)
        }
    }

    pub fn to_column(self) -> i64 {
        match self {
            Self::Megabytes(mb) => i64::try_from(mb).unwrap_or(i64::MAX),
            Self::Unlimited => UNLIMITED_DATA_MB,
        }
    }

    /// True for unlimited plans and for any non-zero megabyte amount.
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Megabytes(0))
    }

    pub fn gigabytes(self) -> DataAmountGb {
        match self {
            Self::Megabytes(mb) => {
                DataAmountGb::Gigabytes(((mb as f64 / 1024.0) * 100.0).round() / 100.0)
            }
            Self::Unlimited => DataAmountGb::Unlimited,
        }
    }
}

impl fmt::Display for DataAllowance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Megabytes(mb) if *mb >= 1024 => write!(f, "{:.1} GB", *mb as f64 / 1024.0),
            Self::Megabytes(mb) => write!(f, "{mb} MB"),
            Self::Unlimited => f.write_str("Unlimited"),
        }
    }
}

/// Gigabyte rendering used by the search API: a number, or the string `"Unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataAmountGb {
    Gigabytes(f64),
    Unlimited,
}

impl Serialize for DataAmountGb {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Gigabytes(gb) => serializer.serialize_f64(*gb),
            Self::Unlimited => serializer.serialize_str("Unlimited"),
        }
    }
}

/// What a provider adapter knows about its own provider row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSeed {
    pub slug: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub credential: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A country code as seen in a provider payload, with whatever metadata came with it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CountryRef {
    pub code: String,
    pub name: Option<String>,
    pub flag: Option<String>,
}

impl CountryRef {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: None,
            flag: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub flag: String,
    pub is_active: bool,
    pub is_regional: bool,
    pub is_global: bool,
}

/// Identity key used to match an incoming record against stored packages.
///
/// `Name` is the weak fallback: two distinct offers with the same name from
/// one provider collapse into a single row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackageIdentity {
    External(String),
    Name(String),
}

/// Adapter output: one provider record translated into the common package shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPackage {
    pub external_id: Option<String>,
    pub name: String,
    pub price: Decimal,
    pub validity_days: i32,
    pub data: DataAllowance,
    pub countries: Vec<CountryRef>,
    pub detail: JsonValue,
}

impl NormalizedPackage {
    pub fn identity(&self) -> PackageIdentity {
        match self.external_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => PackageIdentity::External(id.to_string()),
            _ => PackageIdentity::Name(self.name.clone()),
        }
    }

    pub fn country_codes(&self) -> BTreeSet<&str> {
        self.countries.iter().map(|c| c.code.as_str()).collect()
    }

    pub fn covers(&self, code: &str) -> bool {
        self.countries.iter().any(|c| c.code.eq_ignore_ascii_case(code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub package_id: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub external_id: Option<String>,
    pub name: String,
    pub price: Decimal,
    pub validity_days: i32,
    pub data: DataAllowance,
    pub detail: JsonValue,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Active package row as the data-quality pass needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageSummary {
    pub id: Uuid,
    pub name: String,
    pub provider_name: String,
    pub price: Decimal,
    pub validity_days: i32,
    pub data: DataAllowance,
    pub country_count: usize,
}

/// Inactive package past the retention window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StalePackage {
    pub id: Uuid,
    pub name: String,
    pub provider_name: String,
    pub updated_at: DateTime<Utc>,
}

/// Search filters. Every bound is inclusive; only active packages are searched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageFilter {
    pub country: Option<String>,
    pub provider: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub min_data: Option<i64>,
    pub max_data: Option<i64>,
    pub min_validity: Option<i32>,
    pub max_validity: Option<i32>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

impl PackageFilter {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.page_size())
    }

    /// Unlimited data counts as larger than any bound.
    pub fn accepts_data(&self, data: DataAllowance) -> bool {
        match data {
            DataAllowance::Unlimited => self.max_data.is_none(),
            DataAllowance::Megabytes(mb) => {
                let mb = i64::try_from(mb).unwrap_or(i64::MAX);
                self.min_data.map_or(true, |min| mb >= min)
                    && self.max_data.map_or(true, |max| mb <= max)
            }
        }
    }

    pub fn accepts_price(&self, price: Decimal) -> bool {
        self.min_price.map_or(true, |min| price >= min)
            && self.max_price.map_or(true, |max| price <= max)
    }

    pub fn accepts_validity(&self, days: i32) -> bool {
        self.min_validity.map_or(true, |min| days >= min)
            && self.max_validity.map_or(true, |max| days <= max)
    }

    pub fn accepts_name(&self, name: &str) -> bool {
        match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => name.to_lowercase().contains(&term.to_lowercase()),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CountryBrief {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageListing {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_name: Option<String>,
    pub provider: ProviderRef,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub data_amount_mb: i64,
    pub data_amount_gb: DataAmountGb,
    pub validity_days: i32,
    pub countries: Vec<CountryBrief>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PackageListing {
    pub fn data(&self) -> DataAllowance {
        DataAllowance::from_column(self.data_amount_mb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl Pagination {
    pub fn new(page: u32, page_size: u32, total_count: u64) -> Self {
        let size = u64::from(page_size.max(1));
        let end = u64::from(page.max(1)) * size;
        Self {
            page,
            page_size,
            total_count,
            total_pages: total_count.div_ceil(size),
            has_next: end < total_count,
            has_previous: page > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackagePage {
    pub packages: Vec<PackageListing>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeneralStats {
    pub total_packages: u64,
    pub active_packages: u64,
    pub inactive_packages: u64,
    pub total_providers: u64,
    pub total_countries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub slug: String,
    pub total_packages: u64,
    pub active_packages: u64,
    pub inactive_packages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryStats {
    pub code: String,
    pub name: String,
    pub package_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub general: GeneralStats,
    pub providers: Vec<ProviderStats>,
    pub top_countries: Vec<CountryStats>,
}

/// Number of countries reported by [`CatalogStats::top_countries`].
pub const TOP_COUNTRIES: usize = 10;

/// Data-quality finding on an active package. Findings never block reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationIssue {
    PriceNotPositive,
    DataNotPositive,
    ValidityNotPositive,
    MissingName,
    NoCountries,
}

impl ValidationIssue {
    pub fn reason(self) -> &'static str {
        match self {
            Self::PriceNotPositive => "price is zero or negative",
            Self::DataNotPositive => "data amount is zero or negative",
            Self::ValidityNotPositive => "validity is zero or negative",
            Self::MissingName => "name is empty or the default placeholder",
            Self::NoCountries => "no countries assigned",
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl Serialize for ValidationIssue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.reason())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageIssues {
    pub package_id: Uuid,
    pub name: String,
    pub provider: String,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub total_active: u64,
    pub problematic_count: u64,
    pub success_rate: f64,
    pub issues: Vec<PackageIssues>,
}

impl ValidationReport {
    pub fn success_rate(total_active: u64, problematic: u64) -> f64 {
        if total_active == 0 {
            return 0.0;
        }
        let rate = (total_active.saturating_sub(problematic)) as f64 / total_active as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }
}

/// Price as a float for places that only display it.
pub fn price_as_f64(price: Decimal) -> f64 {
    price.to_f64().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pkg(external_id: Option<&str>, name: &str) -> NormalizedPackage {
        NormalizedPackage {
            external_id: external_id.map(ToString::to_string),
            name: name.to_string(),
            price: dec!(4.50),
            validity_days: 7,
            data: DataAllowance::Megabytes(1024),
            countries: vec![CountryRef::code("TR")],
            detail: JsonValue::Null,
        }
    }

    #[test]
    fn identity_prefers_external_id_and_falls_back_to_name() {
        assert_eq!(
            pkg(Some("P-1"), "Turkey 1GB").identity(),
            PackageIdentity::External("P-1".into())
        );
        let by_name = PackageIdentity::Name("Turkey 1GB".into());
        assert_eq!(pkg(None, "Turkey 1GB").identity(), by_name);
        assert_eq!(pkg(Some("  "), "Turkey 1GB").identity(), by_name);
    }

    #[test]
    fn unlimited_survives_the_column_encoding() {
        assert_eq!(DataAllowance::from_column(-1), DataAllowance::Unlimited);
        assert_eq!(DataAllowance::Unlimited.to_column(), UNLIMITED_DATA_MB);
        assert_eq!(DataAllowance::from_column(2048), DataAllowance::Megabytes(2048));
        assert!(!DataAllowance::Megabytes(0).is_usable());
        assert!(DataAllowance::Unlimited.is_usable());
    }

    #[test]
    fn gigabyte_rendering_rounds_and_names_unlimited() {
        assert_eq!(DataAllowance::Megabytes(1536).gigabytes(), DataAmountGb::Gigabytes(1.5));
        assert_eq!(
            serde_json::to_value(DataAllowance::Unlimited.gigabytes()).unwrap(),
            serde_json::json!("Unlimited")
        );
        assert_eq!(DataAllowance::Megabytes(3072).to_string(), "3.0 GB");
        assert_eq!(DataAllowance::Megabytes(500).to_string(), "500 MB");
    }

    #[test]
    fn pagination_math_matches_page_window() {
        let p = Pagination::new(2, 20, 45);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(p.has_previous);
        let last = Pagination::new(3, 20, 45);
        assert!(!last.has_next);
    }

    #[test]
    fn filter_treats_unlimited_as_larger_than_any_bound() {
        let min_only = PackageFilter {
            min_data: Some(5000),
            ..Default::default()
        };
        assert!(min_only.accepts_data(DataAllowance::Unlimited));
        assert!(!min_only.accepts_data(DataAllowance::Megabytes(1024)));

        let max_only = PackageFilter {
            max_data: Some(5000),
            ..Default::default()
        };
        assert!(!max_only.accepts_data(DataAllowance::Unlimited));
        assert!(max_only.accepts_data(DataAllowance::Megabytes(1024)));
    }

    #[test]
    fn page_size_is_clamped() {
        let filter = PackageFilter {
            page: Some(0),
            page_size: Some(1000),
            ..Default::default()
        };
        assert_eq!(filter.page(), 1);
        assert_eq!(filter.page_size(), MAX_PAGE_SIZE);
        assert_eq!(filter.offset(), 0);
    }
}
