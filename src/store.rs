use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, FromPrimitive};
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::PgPool;
use crate::models::{
    BorrowerAccount, BorrowerIncome, Document, NewBorrower, NewBorrowerAccount, NewBorrowerIncome,
    NewDocument, NewSourceReference, SourceReferenceRow,
};
use crate::records::BorrowerRecord;
use crate::schema::{borrower_accounts, borrower_incomes, borrowers, documents, source_references};

pub const ACCOUNT_TYPE_BANK: &str = "bank";
pub const ACCOUNT_TYPE_LOAN: &str = "loan";

/// Confidence below which a persisted borrower is marked for review.
const REVIEW_THRESHOLD: f64 = 0.70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

/// Result of the atomic PENDING -> PROCESSING transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller won the transition.
    Claimed,
    /// Another delivery already holds the document.
    AlreadyProcessing,
    /// Document finished earlier; the stored status is returned.
    Terminal(DocumentStatus),
    NotFound,
}

/// Document row boundary consumed by the task pipeline and the ingress
/// routes. Status transitions are serialized per row by the database.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get(&self, id: Uuid) -> Result<Option<Document>>;
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;
    async fn insert(&self, document: NewDocument) -> Result<Document>;
    async fn set_blob_uri(&self, id: Uuid, blob_uri: &str) -> Result<()>;
    async fn claim_processing(&self, id: Uuid) -> Result<ClaimOutcome>;
    /// Flush intermediate progress so a crash mid-pipeline stays diagnosable.
    async fn update_progress(&self, id: Uuid, page_count: i32, ocr_processed: bool) -> Result<()>;
    async fn finish(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<()>;
    async fn list(&self) -> Result<Vec<Document>>;
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Write-side borrower boundary. One call persists the borrower and all of
/// its relations atomically.
#[async_trait]
pub trait BorrowerSink: Send + Sync + 'static {
    async fn persist(&self, record: &BorrowerRecord, document_id: Uuid) -> Result<Uuid>;
}

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("database pool error: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("database task panicked")?
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        self.with_conn(move |conn| {
            documents::table
                .find(id)
                .first::<Document>(conn)
                .optional()
                .context("failed to load document")
        })
        .await
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let content_hash = content_hash.to_string();
        self.with_conn(move |conn| {
            documents::table
                .filter(documents::content_hash.eq(&content_hash))
                .first::<Document>(conn)
                .optional()
                .context("failed to look up document by hash")
        })
        .await
    }

    async fn insert(&self, document: NewDocument) -> Result<Document> {
        self.with_conn(move |conn| {
            diesel::insert_into(documents::table)
                .values(&document)
                .execute(conn)
                .context("failed to insert document")?;
            documents::table
                .find(document.id)
                .first::<Document>(conn)
                .context("failed to reload inserted document")
        })
        .await
    }

    async fn set_blob_uri(&self, id: Uuid, blob_uri: &str) -> Result<()> {
        let blob_uri = blob_uri.to_string();
        self.with_conn(move |conn| {
            diesel::update(documents::table.find(id))
                .set((
                    documents::blob_uri.eq(&blob_uri),
                    documents::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .context("failed to set blob uri")?;
            Ok(())
        })
        .await
    }

    async fn claim_processing(&self, id: Uuid) -> Result<ClaimOutcome> {
        self.with_conn(move |conn| {
            let updated = diesel::update(
                documents::table
                    .find(id)
                    .filter(documents::status.eq(DocumentStatus::Pending.as_str())),
            )
            .set((
                documents::status.eq(DocumentStatus::Processing.as_str()),
                documents::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .context("failed to claim document")?;

            if updated == 1 {
                return Ok(ClaimOutcome::Claimed);
            }

            let status: Option<String> = documents::table
                .find(id)
                .select(documents::status)
                .first(conn)
                .optional()
                .context("failed to read document status")?;

            match status.as_deref() {
                None => Ok(ClaimOutcome::NotFound),
                Some("processing") => Ok(ClaimOutcome::AlreadyProcessing),
                Some(other) => {
                    let status = other
                        .parse::<DocumentStatus>()
                        .map_err(|err| anyhow!(err))?;
                    Ok(ClaimOutcome::Terminal(status))
                }
            }
        })
        .await
    }

    async fn update_progress(&self, id: Uuid, page_count: i32, ocr_processed: bool) -> Result<()> {
        self.with_conn(move |conn| {
            diesel::update(documents::table.find(id))
                .set((
                    documents::page_count.eq(page_count),
                    documents::ocr_processed.eq(ocr_processed),
                    documents::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .context("failed to update document progress")?;
            Ok(())
        })
        .await
    }

    async fn finish(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            diesel::update(documents::table.find(id))
                .set((
                    documents::status.eq(status.as_str()),
                    documents::error_message.eq(error_message),
                    documents::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .context("failed to finish document")?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Document>> {
        self.with_conn(move |conn| {
            documents::table
                .order(documents::created_at.desc())
                .load::<Document>(conn)
                .context("failed to list documents")
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let deleted = diesel::delete(documents::table.find(id))
                .execute(conn)
                .context("failed to delete document")?;
            Ok(deleted == 1)
        })
        .await
    }
}

pub struct PgBorrowerSink {
    pool: PgPool,
}

impl PgBorrowerSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// One-way hash of a normalized SSN; the raw value never reaches storage.
pub fn hash_ssn(ssn: &str) -> String {
    hex::encode(Sha256::digest(ssn.as_bytes()))
}

#[async_trait]
impl BorrowerSink for PgBorrowerSink {
    async fn persist(&self, record: &BorrowerRecord, document_id: Uuid) -> Result<Uuid> {
        let record = record.clone();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("database pool error: {err}"))?;
            conn.transaction(|conn| persist_borrower(conn, &record, document_id))
                .context("failed to persist borrower")
        })
        .await
        .context("database task panicked")?
    }
}

fn persist_borrower(
    conn: &mut PgConnection,
    record: &BorrowerRecord,
    document_id: Uuid,
) -> std::result::Result<Uuid, diesel::result::Error> {
    let ssn_hash = record.ssn.as_deref().map(hash_ssn);
    let address_json = record
        .address
        .as_ref()
        .and_then(|address| serde_json::to_value(address).ok());

    let new_borrower = NewBorrower {
        id: record.id,
        document_id,
        name: record.name.clone(),
        ssn_hash,
        phone: record.phone.clone(),
        email: record.email.clone(),
        address_json,
        confidence_score: BigDecimal::from_f64(record.confidence_score)
            .unwrap_or_else(|| BigDecimal::from(0)),
        requires_review: record.confidence_score < REVIEW_THRESHOLD,
    };
    diesel::insert_into(borrowers::table)
        .values(&new_borrower)
        .execute(conn)?;

    for income in &record.income_history {
        let row = NewBorrowerIncome {
            id: Uuid::new_v4(),
            borrower_id: record.id,
            amount: income.amount.clone(),
            period: income.period.clone(),
            year: income.year,
            source_type: income.source_type.clone(),
            employer: income.employer.clone(),
        };
        diesel::insert_into(borrower_incomes::table)
            .values(&row)
            .execute(conn)?;
    }

    for number in &record.account_numbers {
        let row = NewBorrowerAccount {
            id: Uuid::new_v4(),
            borrower_id: record.id,
            number: number.clone(),
            account_type: ACCOUNT_TYPE_BANK.to_string(),
        };
        diesel::insert_into(borrower_accounts::table)
            .values(&row)
            .execute(conn)?;
    }
    for number in &record.loan_numbers {
        let row = NewBorrowerAccount {
            id: Uuid::new_v4(),
            borrower_id: record.id,
            number: number.clone(),
            account_type: ACCOUNT_TYPE_LOAN.to_string(),
        };
        diesel::insert_into(borrower_accounts::table)
            .values(&row)
            .execute(conn)?;
    }

    for source in &record.sources {
        let row = NewSourceReference {
            id: Uuid::new_v4(),
            borrower_id: record.id,
            document_id: source.document_id,
            document_name: source.document_name.clone(),
            page_number: source.page_number,
            section: source.section.clone(),
            snippet: source.snippet.chars().take(500).collect(),
            char_start: source.char_start.map(|v| v as i32),
            char_end: source.char_end.map(|v| v as i32),
        };
        diesel::insert_into(source_references::table)
            .values(&row)
            .execute(conn)?;
    }

    Ok(record.id)
}

/// Read-side rows for the borrower API.
pub fn load_borrower_relations(
    conn: &mut PgConnection,
    borrower_ids: &[Uuid],
) -> QueryResult<(
    Vec<BorrowerIncome>,
    Vec<BorrowerAccount>,
    Vec<SourceReferenceRow>,
)> {
    let incomes = borrower_incomes::table
        .filter(borrower_incomes::borrower_id.eq_any(borrower_ids))
        .order(borrower_incomes::year.asc())
        .load::<BorrowerIncome>(conn)?;
    let accounts = borrower_accounts::table
        .filter(borrower_accounts::borrower_id.eq_any(borrower_ids))
        .load::<BorrowerAccount>(conn)?;
    let sources = source_references::table
        .filter(source_references::borrower_id.eq_any(borrower_ids))
        .order(source_references::page_number.asc())
        .load::<SourceReferenceRow>(conn)?;
    Ok((incomes, accounts, sources))
}
