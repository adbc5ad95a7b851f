//! Tenant accounts and usage metering on SQLite.
//!
//! Quotas are advisory: a tenant over their plan ceiling still gets their
//! document back, and the breach is surfaced through logs rather than a
//! failed request. Increments are single atomic UPDATE statements so
//! concurrent requests for the same tenant never lose counts.

use chrono::{Datelike, NaiveDate, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::PipelineError;

/// Subscription tier, stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTier {
    Trial,
    Starter,
    Pro,
    Unlimited,
}

impl PlanTier {
    /// Lifetime page allowance, `None` for uncapped plans.
    pub fn page_ceiling(self) -> Option<i64> {
        match self {
            PlanTier::Trial => Some(500),
            PlanTier::Starter => Some(5_000),
            PlanTier::Pro => Some(25_000),
            PlanTier::Unlimited => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Trial => "trial",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Unlimited => "unlimited",
        }
    }

    /// Unknown tier text falls back to the most restrictive plan.
    pub fn parse(value: &str) -> Self {
        match value {
            "starter" => PlanTier::Starter,
            "pro" => PlanTier::Pro,
            "unlimited" => PlanTier::Unlimited,
            _ => PlanTier::Trial,
        }
    }
}

/// A provisioned tenant, keyed by the email presented with each request.
#[derive(Debug, Clone)]
pub struct TenantAccount {
    pub id: i64,
    pub email: String,
    pub plan: PlanTier,
    pub pages_used: i64,
}

/// Accounting period, one calendar month, rendered as `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn current() -> Self {
        Self::for_date(Utc::now().date_naive())
    }

    pub fn for_date(date: NaiveDate) -> Self {
        PeriodKey(format!("{:04}-{:02}", date.year(), date.month()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Create the ledger schema if it does not exist.
pub async fn migrate(pool: &SqlitePool) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            plan TEXT NOT NULL DEFAULT 'trial',
            pages_used INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_periods (
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            period TEXT NOT NULL,
            pages_used INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant_id, period)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Tenant lookup and provisioning.
#[derive(Clone)]
pub struct TenantStore {
    pool: SqlitePool,
}

impl TenantStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the tenant presented with a request; `None` means the caller
    /// is not provisioned and nothing downstream should run for them.
    pub async fn get_by_email(&self, email: &str) -> Result<Option<TenantAccount>, PipelineError> {
        let row = sqlx::query("SELECT id, email, plan, pages_used FROM tenants WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| TenantAccount {
            id: row.get("id"),
            email: row.get("email"),
            plan: PlanTier::parse(row.get("plan")),
            pages_used: row.get("pages_used"),
        }))
    }

    pub async fn create(
        &self,
        email: &str,
        plan: PlanTier,
    ) -> Result<TenantAccount, PipelineError> {
        let row = sqlx::query(
            "INSERT INTO tenants (email, plan) VALUES (?, ?) RETURNING id, pages_used",
        )
        .bind(email)
        .bind(plan.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(TenantAccount {
            id: row.get("id"),
            email: email.to_string(),
            plan,
            pages_used: row.get("pages_used"),
        })
    }
}

/// Totals after an increment, for response logging and quota checks.
#[derive(Debug, Clone, Copy)]
pub struct UsageTotals {
    pub lifetime: i64,
    pub period: i64,
}

/// Records page consumption. Lifetime and per-period counters are kept
/// in step; both increments are idempotence-free adds, so callers invoke
/// `record` exactly once per delivered document.
#[derive(Clone)]
pub struct UsageLedger {
    pool: SqlitePool,
}

impl UsageLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add `pages` to the tenant's lifetime and period counters, returning
    /// the new totals. Exceeding the plan ceiling logs a warning but never
    /// fails the call.
    pub async fn record(
        &self,
        tenant: &TenantAccount,
        pages: u32,
        period: &PeriodKey,
    ) -> Result<UsageTotals, PipelineError> {
        let row = sqlx::query(
            "UPDATE tenants SET pages_used = pages_used + ? WHERE id = ? RETURNING pages_used",
        )
        .bind(pages as i64)
        .bind(tenant.id)
        .fetch_one(&self.pool)
        .await?;
        let lifetime: i64 = row.get("pages_used");

        let row = sqlx::query(
            r#"
            INSERT INTO usage_periods (tenant_id, period, pages_used)
            VALUES (?, ?, ?)
            ON CONFLICT (tenant_id, period)
            DO UPDATE SET pages_used = pages_used + excluded.pages_used
            RETURNING pages_used
            "#,
        )
        .bind(tenant.id)
        .bind(period.as_str())
        .bind(pages as i64)
        .fetch_one(&self.pool)
        .await?;
        let period_total: i64 = row.get("pages_used");

        if let Some(ceiling) = tenant.plan.page_ceiling() {
            if lifetime > ceiling {
                tracing::warn!(
                    tenant = %tenant.email,
                    plan = tenant.plan.as_str(),
                    used = lifetime,
                    ceiling,
                    "tenant is over their page allowance"
                );
            }
        }

        Ok(UsageTotals {
            lifetime,
            period: period_total,
        })
    }

    /// Period counter for a tenant, zero when no usage was recorded yet.
    pub async fn period_usage(
        &self,
        tenant: &TenantAccount,
        period: &PeriodKey,
    ) -> Result<i64, PipelineError> {
        let row = sqlx::query(
            "SELECT pages_used FROM usage_periods WHERE tenant_id = ? AND period = ?",
        )
        .bind(tenant.id)
        .bind(period.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.get("pages_used")).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    // File-backed database: pooled in-memory SQLite connections do not
    // share state, so concurrency tests need a real file.
    async fn test_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let url = format!("sqlite:{}/ledger.db?mode=rwc", dir.path().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn unknown_email_resolves_to_no_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let store = TenantStore::new(test_pool(&dir).await);
        assert!(store.get_by_email("nobody@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_accumulates_across_documents() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let store = TenantStore::new(pool.clone());
        let ledger = UsageLedger::new(pool);

        let tenant = store.create("acme@example.com", PlanTier::Pro).await.unwrap();
        let period = PeriodKey::for_date(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());

        let totals = ledger.record(&tenant, 10, &period).await.unwrap();
        assert_eq!(totals.lifetime, 10);
        assert_eq!(totals.period, 10);

        let totals = ledger.record(&tenant, 7, &period).await.unwrap();
        assert_eq!(totals.lifetime, 17);
        assert_eq!(totals.period, 17);
    }

    #[tokio::test]
    async fn period_counters_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let store = TenantStore::new(pool.clone());
        let ledger = UsageLedger::new(pool);

        let tenant = store.create("acme@example.com", PlanTier::Starter).await.unwrap();
        let august = PeriodKey::for_date(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        let september = PeriodKey::for_date(NaiveDate::from_ymd_opt(2026, 9, 1).unwrap());

        ledger.record(&tenant, 12, &august).await.unwrap();
        let totals = ledger.record(&tenant, 5, &september).await.unwrap();

        assert_eq!(totals.lifetime, 17);
        assert_eq!(totals.period, 5);
        assert_eq!(ledger.period_usage(&tenant, &august).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn concurrent_increments_never_lose_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let store = TenantStore::new(pool.clone());
        let ledger = UsageLedger::new(pool);

        let tenant = store.create("busy@example.com", PlanTier::Unlimited).await.unwrap();
        let period = PeriodKey::current();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            let tenant = tenant.clone();
            let period = period.clone();
            handles.push(tokio::spawn(async move {
                ledger.record(&tenant, 5, &period).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let refreshed = store
            .get_by_email("busy@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.pages_used, 100);
        assert_eq!(ledger.period_usage(&refreshed, &period).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn ceiling_breach_is_advisory_only() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let store = TenantStore::new(pool.clone());
        let ledger = UsageLedger::new(pool);

        let tenant = store.create("tiny@example.com", PlanTier::Trial).await.unwrap();
        let period = PeriodKey::current();

        let totals = ledger.record(&tenant, 600, &period).await.unwrap();
        assert_eq!(totals.lifetime, 600);

        // Further recording still succeeds past the 500-page trial cap.
        let totals = ledger.record(&tenant, 1, &period).await.unwrap();
        assert_eq!(totals.lifetime, 601);
    }

    #[test]
    fn plan_parse_round_trips_and_defaults() {
        for plan in [
            PlanTier::Trial,
            PlanTier::Starter,
            PlanTier::Pro,
            PlanTier::Unlimited,
        ] {
            assert_eq!(PlanTier::parse(plan.as_str()), plan);
        }
        assert_eq!(PlanTier::parse("enterprise-v2"), PlanTier::Trial);
    }

    #[test]
    fn period_key_formats_year_month() {
        let key = PeriodKey::for_date(NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(key.as_str(), "2026-03");
    }
}
