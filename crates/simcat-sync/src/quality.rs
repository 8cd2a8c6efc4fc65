//! Data-quality pass over active packages. Findings are reported, never fixed.

use rust_decimal::Decimal;
use simcat_core::{
    DataAllowance, PackageIssues, PackageSummary, ValidationIssue, ValidationReport,
    UNNAMED_PACKAGE,
};
use simcat_storage::CatalogStore;
use tracing::info;

use crate::SyncError;

/// Packages listed in a report; counts cover every active package.
pub const VALIDATION_ISSUE_LIMIT: usize = 50;

pub fn issues_for(pkg: &PackageSummary) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if pkg.price <= Decimal::ZERO {
        issues.push(ValidationIssue::PriceNotPositive);
    }
    if pkg.data == DataAllowance::Megabytes(0) {
        issues.push(ValidationIssue::DataNotPositive);
    }
    if pkg.validity_days <= 0 {
        issues.push(ValidationIssue::ValidityNotPositive);
    }
    let name = pkg.name.trim();
    if name.is_empty() || name == UNNAMED_PACKAGE {
        issues.push(ValidationIssue::MissingName);
    }
    if pkg.country_count == 0 {
        issues.push(ValidationIssue::NoCountries);
    }
    issues
}

pub async fn validate(
    store: &dyn CatalogStore,
    limit: usize,
) -> Result<ValidationReport, SyncError> {
    let active = store.active_packages().await?;
    let mut problematic = 0u64;
    let mut listed = Vec::new();

    for pkg in &active {
        let issues = issues_for(pkg);
        if issues.is_empty() {
            continue;
        }
        problematic += 1;
        if listed.len() < limit {
            listed.push(PackageIssues {
                package_id: pkg.id,
                name: pkg.name.clone(),
                provider: pkg.provider_name.clone(),
                issues,
            });
        }
    }

    let total_active = active.len() as u64;
    info!(total_active, problematic, "validated active packages");
    Ok(ValidationReport {
        total_active,
        problematic_count: problematic,
        success_rate: ValidationReport::success_rate(total_active, problematic),
        issues: listed,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use simcat_core::{CountryRef, NormalizedPackage, ProviderSeed};
    use simcat_storage::MemoryCatalogStore;

    use crate::reconcile::Reconciler;

    fn record(name: &str, price: Decimal, mb: u64, codes: &[&str]) -> NormalizedPackage {
        NormalizedPackage {
            external_id: Some(name.to_string()),
            name: name.to_string(),
            price,
            validity_days: 7,
            data: DataAllowance::Megabytes(mb),
            countries: codes.iter().map(|c| CountryRef::code(*c)).collect(),
            detail: json!({}),
        }
    }

    #[tokio::test]
    async fn broken_package_reports_each_reason() {
        let store = Arc::new(MemoryCatalogStore::new());
        let reconciler = Reconciler::new(store.clone());
        let provider = reconciler
            .resolve_provider(&ProviderSeed {
                slug: "esimaccess".into(),
                name: "eSIM Access".into(),
                credential: String::new(),
            })
            .await
            .expect("provider");
        reconciler
            .reconcile(
                &provider,
                &[
                    record("Broken", Decimal::ZERO, 0, &[]),
                    record("Fine", dec!(3.00), 1024, &["TR"]),
                ],
                None,
            )
            .await;

        let report = validate(store.as_ref(), VALIDATION_ISSUE_LIMIT)
            .await
            .expect("validate");
        assert_eq!(report.total_active, 2);
        assert_eq!(report.problematic_count, 1);
        assert_eq!(report.success_rate, 50.0);
        assert_eq!(
            report.issues[0].issues,
            vec![
                ValidationIssue::PriceNotPositive,
                ValidationIssue::DataNotPositive,
                ValidationIssue::NoCountries,
            ]
        );
    }

    #[tokio::test]
    async fn listed_issues_are_capped_but_counts_cover_everything() {
        let store = Arc::new(MemoryCatalogStore::new());
        let reconciler = Reconciler::new(store.clone());
        let provider = reconciler
            .resolve_provider(&ProviderSeed {
                slug: "esimgo".into(),
                name: "eSIM Go".into(),
                credential: String::new(),
            })
            .await
            .expect("provider");
        let broken: Vec<NormalizedPackage> = (0..55)
            .map(|i| record(&format!("Broken {i}"), Decimal::ZERO, 1024, &["TR"]))
            .collect();
        reconciler.reconcile(&provider, &broken, None).await;

        let report = validate(store.as_ref(), VALIDATION_ISSUE_LIMIT)
            .await
            .expect("validate");
        assert_eq!(report.problematic_count, 55);
        assert_eq!(report.issues.len(), 50);
        assert_eq!(report.success_rate, 0.0);
    }

    #[test]
    fn unlimited_data_and_placeholder_name() {
        let pkg = PackageSummary {
            id: uuid::Uuid::new_v4(),
            name: UNNAMED_PACKAGE.to_string(),
            provider_name: "eSIM Go".into(),
            price: dec!(9.99),
            validity_days: 30,
            data: DataAllowance::Unlimited,
            country_count: 3,
        };
        assert_eq!(issues_for(&pkg), vec![ValidationIssue::MissingName]);
    }
}
