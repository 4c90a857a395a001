//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::error::{ApiError, ErrorBody};
use crate::web::middleware::Principal;
use crate::web::state::AppState;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Utc};
use circulation_core::{ActiveBorrow, BorrowReceipt, Inventory, ReturnReceipt, TransactionLogEntry};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, OpenApi, ToSchema};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        borrow_handler,
        return_handler,
        list_user_borrows_handler,
        list_transactions_handler,
        inventory_handler,
    ),
    components(
        schemas(
            BookRequest,
            BorrowResponse,
            ReturnResponse,
            ActiveBorrowResponse,
            TransactionResponse,
            InventoryResponse,
            ErrorBody,
        )
    ),
    tags(
        (name = "Circulation API", description = "Borrow and return books, and audit the circulation log.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookRequest {
    pub book_id: i64,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BorrowResponse {
    pub record_id: i64,
    pub book_id: i64,
    pub borrow_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
}

impl From<BorrowReceipt> for BorrowResponse {
    fn from(receipt: BorrowReceipt) -> Self {
        Self {
            record_id: receipt.record_id,
            book_id: receipt.book_id.get(),
            borrow_date: receipt.borrow_date,
            due_date: receipt.due_date,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReturnResponse {
    pub record_id: i64,
    pub book_id: i64,
    pub return_date: DateTime<Utc>,
}

impl From<ReturnReceipt> for ReturnResponse {
    fn from(receipt: ReturnReceipt) -> Self {
        Self {
            record_id: receipt.record_id,
            book_id: receipt.book_id.get(),
            return_date: receipt.return_date,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBorrowResponse {
    pub record_id: i64,
    pub book_id: i64,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub borrow_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub overdue: bool,
}

impl From<ActiveBorrow> for ActiveBorrowResponse {
    fn from(borrow: ActiveBorrow) -> Self {
        Self {
            record_id: borrow.record_id,
            book_id: borrow.book.id.get(),
            title: borrow.book.title,
            author: borrow.book.author,
            isbn: borrow.book.isbn,
            borrow_date: borrow.borrow_date,
            due_date: borrow.due_date,
            overdue: borrow.overdue,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    /// `BORROW` or `RETURN`.
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

impl From<TransactionLogEntry> for TransactionResponse {
    fn from(entry: TransactionLogEntry) -> Self {
        Self {
            id: entry.id,
            user_id: entry.user_id.get(),
            book_id: entry.book_id.get(),
            kind: entry.kind.as_str().to_string(),
            timestamp: entry.occurred_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InventoryResponse {
    pub book_id: i64,
    pub total: i32,
    pub available: i32,
}

impl From<Inventory> for InventoryResponse {
    fn from(inventory: Inventory) -> Self {
        Self {
            book_id: inventory.book_id.get(),
            total: inventory.total,
            available: inventory.available,
        }
    }
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TransactionQuery {
    /// Maximum number of entries; omit for the full log.
    pub limit: Option<u32>,
    /// Entries to skip from the newest.
    pub offset: Option<u32>,
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Borrow one copy of a book for the calling member.
#[utoipa::path(
    post,
    path = "/circulation/borrow",
    request_body = BookRequest,
    responses(
        (status = 201, description = "Book lent out", body = BorrowResponse),
        (status = 400, description = "Malformed identifier", body = ErrorBody),
        (status = 404, description = "Unknown member or book", body = ErrorBody),
        (status = 409, description = "Limit reached, already held, or out of stock", body = ErrorBody),
        (status = 500, description = "Internal server error", body = ErrorBody)
    ),
    params(
        ("x-user-id" = i64, Header, description = "The calling member, set by the auth gateway.")
    )
)]
pub async fn borrow_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<BookRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let receipt = app_state
        .engine
        .borrow(principal.user_id, req.book_id)
        .await?;
    Ok((StatusCode::CREATED, Json(BorrowResponse::from(receipt))))
}

/// Return the calling member's copy of a book.
#[utoipa::path(
    post,
    path = "/circulation/return",
    request_body = BookRequest,
    responses(
        (status = 200, description = "Book returned", body = ReturnResponse),
        (status = 400, description = "Malformed identifier", body = ErrorBody),
        (status = 409, description = "No active loan for this book", body = ErrorBody),
        (status = 500, description = "Internal server error", body = ErrorBody)
    ),
    params(
        ("x-user-id" = i64, Header, description = "The calling member, set by the auth gateway.")
    )
)]
pub async fn return_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<BookRequest>, JsonRejection>,
) -> Result<Json<ReturnResponse>, ApiError> {
    let Json(req) = payload?;
    let receipt = app_state
        .engine
        .return_book(principal.user_id, req.book_id)
        .await?;
    Ok(Json(receipt.into()))
}

/// List the books a member currently holds.
#[utoipa::path(
    get,
    path = "/users/{user_id}/borrows",
    responses(
        (status = 200, description = "Active loans, oldest first", body = [ActiveBorrowResponse]),
        (status = 400, description = "Malformed member id", body = ErrorBody),
        (status = 403, description = "Another member's loans", body = ErrorBody)
    ),
    params(
        ("user_id" = i64, Path, description = "Member whose loans to list."),
        ("x-user-id" = i64, Header, description = "The calling member, set by the auth gateway.")
    )
)]
pub async fn list_user_borrows_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    user_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Vec<ActiveBorrowResponse>>, ApiError> {
    let Path(user_id) = user_id?;
    principal.ensure_self_or_admin(user_id)?;
    let borrows = app_state
        .engine
        .list_active_borrows_for_user(user_id)
        .await?;
    Ok(Json(borrows.into_iter().map(Into::into).collect()))
}

/// List circulation log entries, newest first. Admin only.
#[utoipa::path(
    get,
    path = "/transactions",
    responses(
        (status = 200, description = "Log entries, newest first", body = [TransactionResponse]),
        (status = 400, description = "Malformed paging parameters", body = ErrorBody),
        (status = 403, description = "Caller is not an admin", body = ErrorBody)
    ),
    params(
        TransactionQuery,
        ("x-user-id" = i64, Header, description = "The calling member, set by the auth gateway."),
        ("x-user-role" = String, Header, description = "`user` or `admin`.")
    )
)]
pub async fn list_transactions_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    query: Result<Query<TransactionQuery>, QueryRejection>,
) -> Result<Json<Vec<TransactionResponse>>, ApiError> {
    let Query(query) = query?;
    principal.ensure_admin()?;
    let entries: Vec<TransactionResponse> = app_state
        .engine
        .list_transactions(query.limit, query.offset.unwrap_or(0))
        .map_ok(TransactionResponse::from)
        .try_collect()
        .await?;
    Ok(Json(entries))
}

/// Show the copy counts of a book.
#[utoipa::path(
    get,
    path = "/books/{book_id}/inventory",
    responses(
        (status = 200, description = "Copy counts", body = InventoryResponse),
        (status = 404, description = "Unknown book", body = ErrorBody)
    ),
    params(
        ("book_id" = i64, Path, description = "Book to inspect."),
        ("x-user-id" = i64, Header, description = "The calling member, set by the auth gateway.")
    )
)]
pub async fn inventory_handler(
    State(app_state): State<Arc<AppState>>,
    book_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<InventoryResponse>, ApiError> {
    let Path(book_id) = book_id?;
    let inventory = app_state.engine.inventory(book_id).await?;
    Ok(Json(inventory.into()))
}
