use std::collections::HashMap;

use axum::extract::{Json, Path, State};
use bigdecimal::ToPrimitive;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Borrower, BorrowerAccount, BorrowerIncome, SourceReferenceRow};
use crate::schema::borrowers;
use crate::state::AppState;
use crate::store::{load_borrower_relations, ACCOUNT_TYPE_LOAN};

#[derive(Serialize)]
pub struct IncomeResponse {
    pub amount: String,
    pub period: String,
    pub year: i32,
    pub source_type: String,
    pub employer: Option<String>,
}

#[derive(Serialize)]
pub struct SourceReferenceResponse {
    pub document_id: Uuid,
    pub document_name: String,
    pub page_number: i32,
    pub section: Option<String>,
    pub snippet: String,
    pub char_start: Option<i32>,
    pub char_end: Option<i32>,
}

#[derive(Serialize)]
pub struct BorrowerResponse {
    pub id: Uuid,
    pub document_id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<Value>,
    pub confidence_score: f64,
    pub requires_review: bool,
    pub income_history: Vec<IncomeResponse>,
    pub account_numbers: Vec<String>,
    pub loan_numbers: Vec<String>,
    pub sources: Vec<SourceReferenceResponse>,
    pub created_at: DateTime<Utc>,
}

fn to_response(
    borrower: Borrower,
    incomes: Vec<BorrowerIncome>,
    accounts: Vec<BorrowerAccount>,
    sources: Vec<SourceReferenceRow>,
) -> BorrowerResponse {
    let (loan_numbers, account_numbers): (Vec<_>, Vec<_>) = accounts
        .into_iter()
        .partition(|account| account.account_type == ACCOUNT_TYPE_LOAN);

    BorrowerResponse {
        id: borrower.id,
        document_id: borrower.document_id,
        name: borrower.name,
        phone: borrower.phone,
        email: borrower.email,
        address: borrower.address_json,
        confidence_score: borrower.confidence_score.to_f64().unwrap_or(0.0),
        requires_review: borrower.requires_review,
        income_history: incomes
            .into_iter()
            .map(|income| IncomeResponse {
                amount: income.amount.to_string(),
                period: income.period,
                year: income.year,
                source_type: income.source_type,
                employer: income.employer,
            })
            .collect(),
        account_numbers: account_numbers.into_iter().map(|a| a.number).collect(),
        loan_numbers: loan_numbers.into_iter().map(|a| a.number).collect(),
        sources: sources
            .into_iter()
            .map(|source| SourceReferenceResponse {
                document_id: source.document_id,
                document_name: source.document_name,
                page_number: source.page_number,
                section: source.section,
                snippet: source.snippet,
                char_start: source.char_start,
                char_end: source.char_end,
            })
            .collect(),
        created_at: borrower.created_at,
    }
}

pub async fn list_borrowers(State(state): State<AppState>) -> AppResult<Json<Vec<BorrowerResponse>>> {
    let pool = state.pool.clone();
    let responses = tokio::task::spawn_blocking(move || -> Result<Vec<BorrowerResponse>, AppError> {
        let mut conn = pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))?;

        let rows: Vec<Borrower> = borrowers::table
            .order(borrowers::created_at.desc())
            .load(&mut conn)?;
        let ids: Vec<Uuid> = rows.iter().map(|b| b.id).collect();
        let (incomes, accounts, sources) = load_borrower_relations(&mut conn, &ids)?;

        let mut incomes_by: HashMap<Uuid, Vec<BorrowerIncome>> = HashMap::new();
        for income in incomes {
            incomes_by.entry(income.borrower_id).or_default().push(income);
        }
        let mut accounts_by: HashMap<Uuid, Vec<BorrowerAccount>> = HashMap::new();
        for account in accounts {
            accounts_by.entry(account.borrower_id).or_default().push(account);
        }
        let mut sources_by: HashMap<Uuid, Vec<SourceReferenceRow>> = HashMap::new();
        for source in sources {
            sources_by.entry(source.borrower_id).or_default().push(source);
        }

        Ok(rows
            .into_iter()
            .map(|borrower| {
                let id = borrower.id;
                to_response(
                    borrower,
                    incomes_by.remove(&id).unwrap_or_default(),
                    accounts_by.remove(&id).unwrap_or_default(),
                    sources_by.remove(&id).unwrap_or_default(),
                )
            })
            .collect())
    })
    .await
    .map_err(|err| AppError::internal(format!("borrower query panicked: {err}")))??;

    Ok(Json(responses))
}

pub async fn get_borrower(
    State(state): State<AppState>,
    Path(borrower_id): Path<Uuid>,
) -> AppResult<Json<BorrowerResponse>> {
    let pool = state.pool.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<BorrowerResponse, AppError> {
        let mut conn = pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))?;

        let borrower: Borrower = borrowers::table.find(borrower_id).first(&mut conn)?;
        let (incomes, accounts, sources) = load_borrower_relations(&mut conn, &[borrower_id])?;
        Ok(to_response(borrower, incomes, accounts, sources))
    })
    .await
    .map_err(|err| AppError::internal(format!("borrower query panicked: {err}")))??;

    Ok(Json(response))
}
