use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub content_hash: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub blob_uri: Option<String>,
    pub status: String,
    pub page_count: Option<i32>,
    pub error_message: Option<String>,
    pub extraction_method: String,
    pub ocr_mode: String,
    pub ocr_processed: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub filename: String,
    pub content_hash: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub blob_uri: Option<String>,
    pub status: String,
    pub extraction_method: String,
    pub ocr_mode: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = borrowers)]
#[diesel(belongs_to(Document))]
pub struct Borrower {
    pub id: Uuid,
    pub document_id: Uuid,
    pub name: String,
    pub ssn_hash: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address_json: Option<serde_json::Value>,
    pub confidence_score: BigDecimal,
    pub requires_review: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = borrowers)]
pub struct NewBorrower {
    pub id: Uuid,
    pub document_id: Uuid,
    pub name: String,
    pub ssn_hash: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address_json: Option<serde_json::Value>,
    pub confidence_score: BigDecimal,
    pub requires_review: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = borrower_incomes)]
#[diesel(belongs_to(Borrower))]
pub struct BorrowerIncome {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub amount: BigDecimal,
    pub period: String,
    pub year: i32,
    pub source_type: String,
    pub employer: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = borrower_incomes)]
pub struct NewBorrowerIncome {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub amount: BigDecimal,
    pub period: String,
    pub year: i32,
    pub source_type: String,
    pub employer: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = borrower_accounts)]
#[diesel(belongs_to(Borrower))]
pub struct BorrowerAccount {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub number: String,
    pub account_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = borrower_accounts)]
pub struct NewBorrowerAccount {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub number: String,
    pub account_type: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = source_references)]
#[diesel(belongs_to(Borrower))]
pub struct SourceReferenceRow {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub document_id: Uuid,
    pub document_name: String,
    pub page_number: i32,
    pub section: Option<String>,
    pub snippet: String,
    pub char_start: Option<i32>,
    pub char_end: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = source_references)]
pub struct NewSourceReference {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub document_id: Uuid,
    pub document_name: String,
    pub page_number: i32,
    pub section: Option<String>,
    pub snippet: String,
    pub char_start: Option<i32>,
    pub char_end: Option<i32>,
}
