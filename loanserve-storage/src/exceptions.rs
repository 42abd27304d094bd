//! `exception_cases` repository (C12).

use loanserve_core::exceptions::{Category, CaseState, ExceptionCase};
use loanserve_core::returns::Severity;
use sqlx::{PgPool, Postgres, Transaction};
use ulid::Ulid;

use crate::error::StorageError;

fn category_str(category: Category) -> &'static str {
    match category {
        Category::AchReturn => "ach_return",
        Category::Nsf => "nsf",
        Category::WireRecall => "wire_recall",
        Category::Duplicate => "duplicate",
        Category::Dispute => "dispute",
        Category::ReconcileVariance => "reconcile_variance",
    }
}

fn parse_category(raw: &str) -> Result<Category, StorageError> {
    Ok(match raw {
        "ach_return" => Category::AchReturn,
        "nsf" => Category::Nsf,
        "wire_recall" => Category::WireRecall,
        "duplicate" => Category::Duplicate,
        "dispute" => Category::Dispute,
        "reconcile_variance" => Category::ReconcileVariance,
        other => return Err(StorageError::NotFound(format!("unknown category {other}"))),
    })
}

fn state_str(state: CaseState) -> &'static str {
    match state {
        CaseState::Open => "open",
        CaseState::Pending => "pending",
        CaseState::Resolved => "resolved",
        CaseState::Cancelled => "cancelled",
    }
}

fn parse_state(raw: &str) -> Result<CaseState, StorageError> {
    Ok(match raw {
        "open" => CaseState::Open,
        "pending" => CaseState::Pending,
        "resolved" => CaseState::Resolved,
        "cancelled" => CaseState::Cancelled,
        other => return Err(StorageError::NotFound(format!("unknown case state {other}"))),
    })
}

fn severity_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn parse_severity(raw: &str) -> Result<Severity, StorageError> {
    Ok(match raw {
        "low" => Severity::Low,
        "medium" => Severity::Medium,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        other => return Err(StorageError::NotFound(format!("unknown severity {other}"))),
    })
}

#[derive(sqlx::FromRow)]
struct CaseRow {
    id: String,
    ingestion_id: Option<String>,
    payment_id: Option<String>,
    category: String,
    subcategory: String,
    severity: String,
    state: String,
    assignee: Option<String>,
    ai_recommendation: Option<String>,
}

impl CaseRow {
    fn into_case(self) -> Result<ExceptionCase, StorageError> {
        Ok(ExceptionCase {
            id: Ulid::from_string(&self.id).map_err(|e| StorageError::NotFound(e.to_string()))?,
            ingestion_id: self
                .ingestion_id
                .map(|s| Ulid::from_string(&s))
                .transpose()
                .map_err(|e| StorageError::NotFound(e.to_string()))?,
            payment_id: self
                .payment_id
                .map(|s| Ulid::from_string(&s))
                .transpose()
                .map_err(|e| StorageError::NotFound(e.to_string()))?,
            category: parse_category(&self.category)?,
            subcategory: self.subcategory,
            severity: parse_severity(&self.severity)?,
            state: parse_state(&self.state)?,
            assignee: self.assignee,
            ai_recommendation: self.ai_recommendation,
        })
    }
}

#[derive(Clone)]
pub struct ExceptionCaseRepository {
    pool: PgPool,
}

impl ExceptionCaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserted in the caller's transaction: an exception case opened
    /// alongside a paused handler (§4.4) must not survive a rollback that
    /// also undoes the idempotency record meant to dedupe the retry.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        case: &ExceptionCase,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO exception_cases
                (id, ingestion_id, payment_id, category, subcategory, severity, state, assignee, ai_recommendation)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(case.id.to_string())
        .bind(case.ingestion_id.map(|id| id.to_string()))
        .bind(case.payment_id.map(|id| id.to_string()))
        .bind(category_str(case.category))
        .bind(&case.subcategory)
        .bind(severity_str(case.severity))
        .bind(state_str(case.state))
        .bind(&case.assignee)
        .bind(&case.ai_recommendation)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    pub async fn find(&self, id: &Ulid) -> Result<Option<ExceptionCase>, StorageError> {
        let row: Option<CaseRow> = sqlx::query_as("SELECT * FROM exception_cases WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(CaseRow::into_case).transpose()
    }

    pub async fn list_open(&self) -> Result<Vec<ExceptionCase>, StorageError> {
        let rows: Vec<CaseRow> = sqlx::query_as(
            "SELECT * FROM exception_cases WHERE state IN ('open', 'pending') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CaseRow::into_case).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<ExceptionCase>, StorageError> {
        let rows: Vec<CaseRow> =
            sqlx::query_as("SELECT * FROM exception_cases ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(CaseRow::into_case).collect()
    }

    pub async fn update(&self, case: &ExceptionCase) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE exception_cases
            SET state = $2, assignee = $3, ai_recommendation = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(case.id.to_string())
        .bind(state_str(case.state))
        .bind(&case.assignee)
        .bind(&case.ai_recommendation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_its_string_form() {
        for category in [
            Category::AchReturn,
            Category::Nsf,
            Category::WireRecall,
            Category::Duplicate,
            Category::Dispute,
            Category::ReconcileVariance,
        ] {
            assert_eq!(parse_category(category_str(category)).unwrap(), category);
        }
    }

    #[test]
    fn state_round_trips_through_its_string_form() {
        for state in [
            CaseState::Open,
            CaseState::Pending,
            CaseState::Resolved,
            CaseState::Cancelled,
        ] {
            assert_eq!(parse_state(state_str(state)).unwrap(), state);
        }
    }

    #[test]
    fn severity_round_trips_through_its_string_form() {
        for severity in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(parse_severity(severity_str(severity)).unwrap(), severity);
        }
    }

    #[test]
    fn unknown_category_is_rejected() {
        assert!(parse_category("chargeback").is_err());
    }

    #[test]
    fn row_with_null_optional_fields_maps_to_a_case_with_no_linkage() {
        let row = CaseRow {
            id: Ulid::new().to_string(),
            ingestion_id: None,
            payment_id: None,
            category: "nsf".into(),
            subcategory: "insufficient_funds".into(),
            severity: "high".into(),
            state: "open".into(),
            assignee: None,
            ai_recommendation: None,
        };
        let case = row.into_case().unwrap();
        assert!(case.ingestion_id.is_none());
        assert!(case.payment_id.is_none());
        assert_eq!(case.category, Category::Nsf);
        assert_eq!(case.severity, Severity::High);
    }

    #[test]
    fn row_with_malformed_ulid_is_rejected() {
        let row = CaseRow {
            id: "not-a-ulid".into(),
            ingestion_id: None,
            payment_id: None,
            category: "nsf".into(),
            subcategory: "x".into(),
            severity: "low".into(),
            state: "open".into(),
            assignee: None,
            ai_recommendation: None,
        };
        assert!(row.into_case().is_err());
    }
}
