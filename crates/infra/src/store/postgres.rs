//! Postgres-backed ledger store.
//!
//! Every transaction runs at `SERIALIZABLE` isolation and additionally takes
//! explicit locks on the rows it decides on:
//!
//! - `SELECT … FOR UPDATE` on the subsidy row for usage, deactivation and expiry
//! - `pg_advisory_xact_lock` keyed on the customer id for creation
//! - a partial unique index on `(customer_id) WHERE status = 'active'`
//!
//! ## Error Mapping
//!
//! | SQLSTATE | Meaning | StoreError |
//! |----------|---------|------------|
//! | `40001` | serialization failure | `Transient` |
//! | `40P01` | deadlock detected | `Transient` |
//! | `55P03` | lock not available | `Transient` |
//! | `23505` | unique violation | `Conflict` |
//! | other | | `Backend` |
//!
//! Pool timeouts and IO errors are `Transient`, except on `COMMIT` where an IO
//! error leaves the outcome unknown and maps to `Backend`. Decode failures are
//! `Corrupt`.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument, warn};
use uuid::Uuid;

use grantledger_core::{
    AuditEntryId, CustomerId, Money, ProviderId, StaffId, SubsidyId, UsageTransactionId,
};
use grantledger_subsidy::{
    AuditAction, AuditLogEntry, ExternalRefs, Provider, Subsidy, SubsidyStatus, SubsidyView,
    UsageTransaction,
};

use super::query::{Page, PageRequest, SubsidyFilter, SubsidySummary};
use super::r#trait::{LedgerStore, LedgerTx};
use crate::error::StoreError;

macro_rules! subsidy_columns {
    () => {
        "s.id, s.customer_id, s.provider_id, s.approved_amount, s.total_amount_used, s.status, \
         s.valid_from, s.valid_until, s.reason, s.admin_notes, s.approved_by, s.approved_at, \
         s.created_at, s.updated_at"
    };
}

macro_rules! usage_columns {
    () => {
        "id, subsidy_id, customer_id, transaction_type, original_amount, subsidy_applied, \
         customer_paid, subscription_id, invoice_id, payment_intent_id, plan_id, description, \
         applied_at"
    };
}

/// Postgres-backed ledger store.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../../migrations/0001_subsidy_ledger.sql"))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Insert or refresh a provider row (the registry itself lives elsewhere).
    #[instrument(skip(self, provider), fields(provider_id = %provider.id), err)]
    pub async fn upsert_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO providers (id, name, contact_email, contact_phone, is_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                contact_email = EXCLUDED.contact_email,
                contact_phone = EXCLUDED.contact_phone,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(provider.id.as_uuid())
        .bind(&provider.name)
        .bind(provider.contact_email.as_deref())
        .bind(provider.contact_phone.as_deref())
        .bind(provider.is_active)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_provider", e))?;
        Ok(())
    }
}

/// Open serializable transaction.
pub struct PostgresLedgerTx {
    tx: Transaction<'static, Postgres>,
}

impl PostgresLedgerTx {
    async fn exec(&mut self, operation: &str, sql: &'static str) -> Result<(), StoreError> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    #[instrument(skip(self), fields(provider_id = %id), err)]
    async fn provider(&mut self, id: ProviderId) -> Result<Option<Provider>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, contact_email, contact_phone, is_active
            FROM providers
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("provider", e))?;

        row.as_ref().map(provider_from_row).transpose()
    }

    #[instrument(skip(self), fields(customer_id = %customer_id), err)]
    async fn lock_customer(&mut self, customer_id: CustomerId) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(customer_id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_customer", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(customer_id = %customer_id), err)]
    async fn find_open_subsidy_for_customer(
        &mut self,
        customer_id: CustomerId,
    ) -> Result<Option<Subsidy>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            subsidy_columns!(),
            " FROM subsidies s WHERE s.customer_id = $1 AND s.status = 'active' LIMIT 1 FOR UPDATE"
        ))
        .bind(customer_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_open_subsidy_for_customer", e))?;

        row.as_ref().map(subsidy_from_row).transpose()
    }

    #[instrument(skip(self), fields(subsidy_id = %id), err)]
    async fn lock_subsidy(&mut self, id: SubsidyId) -> Result<Option<Subsidy>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            subsidy_columns!(),
            " FROM subsidies s WHERE s.id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_subsidy", e))?;

        row.as_ref().map(subsidy_from_row).transpose()
    }

    #[instrument(skip(self, subsidy), fields(subsidy_id = %subsidy.id, customer_id = %subsidy.customer_id), err)]
    async fn insert_subsidy(&mut self, subsidy: &Subsidy) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subsidies (
                id, customer_id, provider_id, approved_amount, total_amount_used, status,
                valid_from, valid_until, reason, admin_notes, approved_by, approved_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(subsidy.id.as_uuid())
        .bind(subsidy.customer_id.as_uuid())
        .bind(subsidy.provider_id.as_uuid())
        .bind(subsidy.approved_amount.cents())
        .bind(subsidy.total_amount_used.cents())
        .bind(subsidy.status.as_str())
        .bind(subsidy.valid_from)
        .bind(subsidy.valid_until)
        .bind(&subsidy.reason)
        .bind(subsidy.admin_notes.as_deref())
        .bind(subsidy.approved_by.map(Uuid::from))
        .bind(subsidy.approved_at)
        .bind(subsidy.created_at)
        .bind(subsidy.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_subsidy", e))?;
        Ok(())
    }

    #[instrument(skip(self, subsidy), fields(subsidy_id = %subsidy.id, status = %subsidy.status), err)]
    async fn update_subsidy(&mut self, subsidy: &Subsidy) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE subsidies
            SET total_amount_used = $2, status = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(subsidy.id.as_uuid())
        .bind(subsidy.total_amount_used.cents())
        .bind(subsidy.status.as_str())
        .bind(subsidy.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_subsidy", e))?;

        if result.rows_affected() != 1 {
            return Err(StoreError::Backend(format!(
                "update_subsidy affected {} rows for {}",
                result.rows_affected(),
                subsidy.id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, usage), fields(usage_id = %usage.id, subsidy_id = %usage.subsidy_id), err)]
    async fn insert_usage(&mut self, usage: &UsageTransaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subsidy_usage_transactions (
                id, subsidy_id, customer_id, transaction_type, original_amount, subsidy_applied,
                customer_paid, subscription_id, invoice_id, payment_intent_id, plan_id,
                description, applied_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(usage.id.as_uuid())
        .bind(usage.subsidy_id.as_uuid())
        .bind(usage.customer_id.as_uuid())
        .bind(&usage.transaction_type)
        .bind(usage.original_amount.cents())
        .bind(usage.subsidy_applied.cents())
        .bind(usage.customer_paid.cents())
        .bind(usage.external_refs.subscription_id.as_deref())
        .bind(usage.external_refs.invoice_id.as_deref())
        .bind(usage.external_refs.payment_intent_id.as_deref())
        .bind(usage.external_refs.plan_id.as_deref())
        .bind(usage.description.as_deref())
        .bind(usage.applied_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_usage", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(usage_id = %id), err)]
    async fn find_usage(&mut self, id: UsageTransactionId) -> Result<Option<UsageTransaction>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            usage_columns!(),
            " FROM subsidy_usage_transactions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_usage", e))?;

        row.as_ref().map(usage_from_row).transpose()
    }

    /// Runs inside a savepoint so a failed insert does not poison the transaction.
    #[instrument(skip(self, entry), fields(action = %entry.action), err)]
    async fn append_audit(&mut self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        self.exec("audit_savepoint", "SAVEPOINT audit_entry").await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO subsidy_audit_log (
                id, subsidy_id, action, performed_by, previous_status, new_status,
                amount_changed, notes, ip_address, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.subsidy_id.map(Uuid::from))
        .bind(entry.action.as_str())
        .bind(entry.performed_by.map(Uuid::from))
        .bind(entry.previous_status.map(SubsidyStatus::as_str))
        .bind(entry.new_status.map(SubsidyStatus::as_str))
        .bind(entry.amount_changed.map(Money::cents))
        .bind(entry.notes.as_deref())
        .bind(entry.ip_address.as_deref())
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await;

        match inserted {
            Ok(_) => self.exec("audit_release", "RELEASE SAVEPOINT audit_entry").await,
            Err(e) => {
                self.exec("audit_rollback", "ROLLBACK TO SAVEPOINT audit_entry").await?;
                Err(map_sqlx_error("append_audit", e))
            }
        }
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(map_commit_error)
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Tx = PostgresLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let mut tx = PostgresLedgerTx { tx };
        tx.exec("set_isolation", "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .await?;
        tx.exec("set_lock_timeout", "SET LOCAL lock_timeout = '5s'").await?;
        Ok(tx)
    }

    #[instrument(skip(self), fields(subsidy_id = %id), err)]
    async fn find_subsidy(&self, id: SubsidyId) -> Result<Option<SubsidyView>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            subsidy_columns!(),
            ", p.name AS provider_name FROM subsidies s JOIN providers p ON p.id = s.provider_id WHERE s.id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_subsidy", e))?;

        row.as_ref().map(view_from_row).transpose()
    }

    #[instrument(skip(self), fields(customer_id = %customer_id), err)]
    async fn find_active_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<SubsidyView>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            subsidy_columns!(),
            ", p.name AS provider_name FROM subsidies s JOIN providers p ON p.id = s.provider_id \
             WHERE s.customer_id = $1 AND s.status = 'active' LIMIT 1"
        ))
        .bind(customer_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active_for_customer", e))?;

        row.as_ref().map(view_from_row).transpose()
    }

    #[instrument(
        skip(self, filter, page),
        fields(page = page.page, per_page = page.per_page, returned = tracing::field::Empty),
        err
    )]
    async fn list_subsidies(
        &self,
        filter: &SubsidyFilter,
        page: PageRequest,
    ) -> Result<Page<SubsidyView>, StoreError> {
        let customer = filter.customer_id.map(Uuid::from);
        let provider = filter.provider_id.map(Uuid::from);
        let status = filter.status.map(SubsidyStatus::as_str);

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM subsidies s
            WHERE ($1::uuid IS NULL OR s.customer_id = $1)
                AND ($2::uuid IS NULL OR s.provider_id = $2)
                AND ($3::text IS NULL OR s.status = $3)
            "#,
        )
        .bind(customer)
        .bind(provider)
        .bind(status)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_subsidies", e))?
        .try_get("total")
        .map_err(|e| corrupt("total", e))?;

        let rows = sqlx::query(concat!(
            "SELECT ",
            subsidy_columns!(),
            ", p.name AS provider_name FROM subsidies s JOIN providers p ON p.id = s.provider_id \
             WHERE ($1::uuid IS NULL OR s.customer_id = $1) \
               AND ($2::uuid IS NULL OR s.provider_id = $2) \
               AND ($3::text IS NULL OR s.status = $3) \
             ORDER BY s.created_at DESC, s.id DESC \
             LIMIT $4 OFFSET $5"
        ))
        .bind(customer)
        .bind(provider)
        .bind(status)
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_subsidies", e))?;

        let items = rows.iter().map(view_from_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("returned", items.len());
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    #[instrument(skip(self), fields(subsidy_id = %id), err)]
    async fn usage_for_subsidy(&self, id: SubsidyId) -> Result<Vec<UsageTransaction>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            usage_columns!(),
            " FROM subsidy_usage_transactions WHERE subsidy_id = $1 ORDER BY applied_at ASC, id ASC"
        ))
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("usage_for_subsidy", e))?;

        rows.iter().map(usage_from_row).collect()
    }

    #[instrument(skip(self), fields(customer_id = %customer_id), err)]
    async fn usage_for_customer(
        &self,
        customer_id: CustomerId,
        page: PageRequest,
    ) -> Result<Page<UsageTransaction>, StoreError> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM subsidy_usage_transactions WHERE customer_id = $1",
        )
        .bind(customer_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_usage", e))?
        .try_get("total")
        .map_err(|e| corrupt("total", e))?;

        let rows = sqlx::query(concat!(
            "SELECT ",
            usage_columns!(),
            " FROM subsidy_usage_transactions WHERE customer_id = $1 \
              ORDER BY applied_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(customer_id.as_uuid())
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("usage_for_customer", e))?;

        let items = rows.iter().map(usage_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    #[instrument(skip(self), fields(subsidy_id = %id), err)]
    async fn audit_for_subsidy(&self, id: SubsidyId) -> Result<Vec<AuditLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, subsidy_id, action, performed_by, previous_status, new_status,
                   amount_changed, notes, ip_address, created_at
            FROM subsidy_audit_log
            WHERE subsidy_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("audit_for_subsidy", e))?;

        rows.iter().map(audit_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn summary(&self) -> Result<SubsidySummary, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'active') AS active_count,
                COUNT(*) FILTER (WHERE status = 'depleted') AS depleted_count,
                COUNT(*) FILTER (WHERE status = 'expired') AS expired_count,
                COALESCE(SUM(approved_amount), 0)::BIGINT AS total_approved,
                COALESCE(SUM(total_amount_used), 0)::BIGINT AS total_used
            FROM subsidies
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("summary", e))?;

        let get = |col: &str| -> Result<i64, StoreError> { row.try_get(col).map_err(|e| corrupt(col, e)) };
        let approved = get("total_approved")?;
        let used = get("total_used")?;

        Ok(SubsidySummary {
            active_count: get("active_count")?.max(0) as u64,
            depleted_count: get("depleted_count")?.max(0) as u64,
            expired_count: get("expired_count")?.max(0) as u64,
            total_approved: Money::from_cents(approved),
            total_used: Money::from_cents(used),
            total_remaining: Money::from_cents(approved - used),
        })
    }

    #[instrument(skip(self), err)]
    async fn find_overdue(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<SubsidyId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM subsidies
            WHERE status = 'active' AND valid_until IS NOT NULL AND valid_until < $1
            ORDER BY valid_until ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_overdue", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(SubsidyId::from_uuid)
                    .map_err(|e| corrupt("id", e))
            })
            .collect()
    }
}

fn corrupt(column: &str, err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to read column {column}: {err}"))
}

fn provider_from_row(row: &PgRow) -> Result<Provider, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("provider row: {e}"));
    Ok(Provider {
        id: ProviderId::from_uuid(row.try_get("id").map_err(read)?),
        name: row.try_get("name").map_err(read)?,
        contact_email: row.try_get("contact_email").map_err(read)?,
        contact_phone: row.try_get("contact_phone").map_err(read)?,
        is_active: row.try_get("is_active").map_err(read)?,
    })
}

fn subsidy_from_row(row: &PgRow) -> Result<Subsidy, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("subsidy row: {e}"));
    let status: String = row.try_get("status").map_err(read)?;
    let status = SubsidyStatus::from_str(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    Ok(Subsidy {
        id: SubsidyId::from_uuid(row.try_get("id").map_err(read)?),
        customer_id: CustomerId::from_uuid(row.try_get("customer_id").map_err(read)?),
        provider_id: ProviderId::from_uuid(row.try_get("provider_id").map_err(read)?),
        approved_amount: Money::from_cents(row.try_get("approved_amount").map_err(read)?),
        total_amount_used: Money::from_cents(row.try_get("total_amount_used").map_err(read)?),
        status,
        valid_from: row.try_get("valid_from").map_err(read)?,
        valid_until: row.try_get("valid_until").map_err(read)?,
        reason: row.try_get("reason").map_err(read)?,
        admin_notes: row.try_get("admin_notes").map_err(read)?,
        approved_by: row
            .try_get::<Option<Uuid>, _>("approved_by")
            .map_err(read)?
            .map(StaffId::from_uuid),
        approved_at: row.try_get("approved_at").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

fn view_from_row(row: &PgRow) -> Result<SubsidyView, StoreError> {
    Ok(SubsidyView {
        subsidy: subsidy_from_row(row)?,
        provider_name: row.try_get("provider_name").map_err(|e| corrupt("provider_name", e))?,
    })
}

fn usage_from_row(row: &PgRow) -> Result<UsageTransaction, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("usage row: {e}"));
    Ok(UsageTransaction {
        id: UsageTransactionId::from_uuid(row.try_get("id").map_err(read)?),
        subsidy_id: SubsidyId::from_uuid(row.try_get("subsidy_id").map_err(read)?),
        customer_id: CustomerId::from_uuid(row.try_get("customer_id").map_err(read)?),
        transaction_type: row.try_get("transaction_type").map_err(read)?,
        original_amount: Money::from_cents(row.try_get("original_amount").map_err(read)?),
        subsidy_applied: Money::from_cents(row.try_get("subsidy_applied").map_err(read)?),
        customer_paid: Money::from_cents(row.try_get("customer_paid").map_err(read)?),
        external_refs: ExternalRefs {
            subscription_id: row.try_get("subscription_id").map_err(read)?,
            invoice_id: row.try_get("invoice_id").map_err(read)?,
            payment_intent_id: row.try_get("payment_intent_id").map_err(read)?,
            plan_id: row.try_get("plan_id").map_err(read)?,
        },
        description: row.try_get("description").map_err(read)?,
        applied_at: row.try_get("applied_at").map_err(read)?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditLogEntry, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("audit row: {e}"));
    let parse_status = |value: Option<String>| -> Result<Option<SubsidyStatus>, StoreError> {
        value
            .map(|s| SubsidyStatus::from_str(&s).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()
    };

    let action: String = row.try_get("action").map_err(read)?;
    let action = AuditAction::parse(&action)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown audit action: {action}")))?;

    Ok(AuditLogEntry {
        id: AuditEntryId::from_uuid(row.try_get("id").map_err(read)?),
        subsidy_id: row
            .try_get::<Option<Uuid>, _>("subsidy_id")
            .map_err(read)?
            .map(SubsidyId::from_uuid),
        action,
        performed_by: row
            .try_get::<Option<Uuid>, _>("performed_by")
            .map_err(read)?
            .map(StaffId::from_uuid),
        previous_status: parse_status(row.try_get("previous_status").map_err(read)?)?,
        new_status: parse_status(row.try_get("new_status").map_err(read)?)?,
        amount_changed: row
            .try_get::<Option<i64>, _>("amount_changed")
            .map_err(read)?
            .map(Money::from_cents),
        notes: row.try_get("notes").map_err(read)?,
        ip_address: row.try_get("ip_address").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
    })
}

/// Classify a Postgres SQLSTATE.
fn classify_sqlstate(code: Option<&str>, msg: String) -> StoreError {
    match code {
        Some("40001") | Some("40P01") | Some("55P03") => StoreError::Transient(msg),
        Some("23505") => StoreError::Conflict(msg),
        _ => StoreError::Backend(msg),
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            let code = db_err.code();
            let store_err = classify_sqlstate(code.as_deref(), msg);
            if store_err.is_transient() {
                warn!(operation, sqlstate = ?code, "transient database failure");
            }
            store_err
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

/// A SQLSTATE raised by `COMMIT` means the server rolled back. Any other
/// failure leaves the outcome unknown and must not be retried blindly.
fn map_commit_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(_) => map_sqlx_error("commit_transaction", err),
        other => StoreError::Backend(format!("commit outcome unknown: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_and_lock_failures_are_transient() {
        for code in ["40001", "40P01", "55P03"] {
            assert!(classify_sqlstate(Some(code), String::new()).is_transient(), "{code}");
        }
    }

    #[test]
    fn unique_violation_is_conflict() {
        assert!(matches!(
            classify_sqlstate(Some("23505"), "dup".into()),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("23514"), "check".into()),
            StoreError::Backend(_)
        ));
        assert!(matches!(classify_sqlstate(None, "?".into()), StoreError::Backend(_)));
    }

    #[test]
    fn pool_errors_are_classified() {
        assert!(map_sqlx_error("begin", sqlx::Error::PoolTimedOut).is_transient());
        assert!(matches!(
            map_sqlx_error("begin", sqlx::Error::PoolClosed),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn lost_connection_during_commit_is_not_retryable() {
        let io = || sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));

        assert!(map_sqlx_error("insert_usage", io()).is_transient());
        let err = map_commit_error(io());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("commit outcome unknown"));
    }

    /// Concurrency check against a live database.
    ///
    /// Run with `DATABASE_URL=postgres://… cargo test -- --ignored`.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_usage_against_postgres_never_overspends() -> anyhow::Result<()> {
        use grantledger_subsidy::CreateSubsidy;

        let Ok(url) = std::env::var("DATABASE_URL") else {
            return Ok(());
        };
        let store = PostgresLedgerStore::connect(&url).await?;
        store.migrate().await?;

        let provider = Provider::new(ProviderId::new(), "Integration Fund");
        store.upsert_provider(&provider).await?;

        let cmd = CreateSubsidy {
            customer_id: CustomerId::new(),
            provider_id: provider.id,
            approved_amount: Money::from_major(100),
            reason: "integration".into(),
            valid_until: None,
            admin_notes: None,
        };
        let subsidy = Subsidy::approve(SubsidyId::new(), &cmd, StaffId::new(), Utc::now());
        let mut tx = store.begin().await?;
        tx.insert_subsidy(&subsidy).await?;
        tx.commit().await?;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let id = subsidy.id;
            handles.push(tokio::spawn(async move {
                let mut tx = store.begin().await?;
                let mut s = tx.lock_subsidy(id).await?.ok_or_else(|| StoreError::Backend("missing".into()))?;
                if s.apply_usage(Money::from_major(70), Utc::now()).is_err() {
                    return Ok::<bool, StoreError>(false);
                }
                tx.update_subsidy(&s).await?;
                tx.commit().await?;
                Ok(true)
            }));
        }

        let mut applied = 0;
        for h in handles {
            if let Ok(Ok(true)) = h.await {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let view = store
            .find_subsidy(subsidy.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("subsidy vanished"))?;
        assert_eq!(view.subsidy.total_amount_used, Money::from_major(70));
        Ok(())
    }
}
