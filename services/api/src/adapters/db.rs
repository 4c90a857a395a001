//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of the
//! storage ports from the `core` crate. It handles all interactions with the
//! PostgreSQL database using `sqlx`.
//!
//! ## Isolation
//!
//! Each unit of work is one Postgres transaction at the default isolation level.
//! Writers are serialized where it matters by explicit locks:
//! - the member's loans by `pg_advisory_xact_lock(user_id)`,
//! - a title's counters by `SELECT ... FOR UPDATE` on its inventory row.
//!
//! Locks are always taken member first, then title.
//!
//! ## Error Mapping
//!
//! | SQLSTATE | PortError | Scenario |
//! |----------|-----------|----------|
//! | `23505` | `Duplicate` | second active loan for the same member and title |
//! | `23514` | `InvariantViolation` | inventory bounds check rejected a write |
//! | `40001`, `40P01` | `Conflict` | serialization failure or deadlock |
//! | other | `Unexpected` | connection loss, pool closed, ... |

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use circulation_core::domain::{
    ActiveBorrow, Book, BookId, BookStatus, BorrowRecord, BorrowStatus, Inventory, LogPage, Role,
    TransactionLogEntry, TransactionType, User, UserId,
};
use circulation_core::ports::{
    BorrowRecordStore, CirculationReader, CirculationStorage, Directory, InventoryStore,
    LogStream, PortError, PortResult, TransactionLog, UnitOfWork,
};
use futures::TryStreamExt;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the storage ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn map_sqlx_error(context: &str, err: sqlx::Error) -> PortError {
    match &err {
        sqlx::Error::RowNotFound => PortError::NotFound(context.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => PortError::Duplicate(format!("{}: {}", context, db.message())),
            Some("23514") => {
                PortError::InvariantViolation(format!("{}: {}", context, db.message()))
            }
            Some("40001") | Some("40P01") => {
                PortError::Conflict(format!("{}: {}", context, db.message()))
            }
            _ => PortError::Unexpected(format!("{}: {}", context, err)),
        },
        _ => PortError::Unexpected(format!("{}: {}", context, err)),
    }
}

fn stored_id<T>(
    raw: i64,
    parse: fn(i64) -> Result<T, circulation_core::CirculationError>,
) -> PortResult<T> {
    parse(raw).map_err(|e| PortError::InvariantViolation(format!("stored row: {}", e)))
}

fn corrupt(column: &str, value: &str) -> PortError {
    PortError::InvariantViolation(format!("unexpected {} '{}' in storage", column, value))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    id: i64,
    role: String,
}
impl UserRecord {
    fn to_domain(self) -> PortResult<User> {
        Ok(User {
            id: stored_id(self.id, UserId::new)?,
            role: Role::parse(&self.role).ok_or_else(|| corrupt("role", &self.role))?,
        })
    }
}

#[derive(FromRow)]
struct BookRecord {
    id: i64,
    title: String,
    author: String,
    isbn: String,
    category_id: Option<i64>,
    publisher: String,
    status: String,
}
impl BookRecord {
    fn to_domain(self) -> PortResult<Book> {
        let status = BookStatus::parse(&self.status)
            .ok_or_else(|| corrupt("book status", &self.status))?;
        Ok(Book {
            id: stored_id(self.id, BookId::new)?,
            title: self.title,
            author: self.author,
            isbn: self.isbn,
            category_id: self.category_id,
            publisher: self.publisher,
            status,
        })
    }
}

#[derive(FromRow)]
struct InventoryRecord {
    book_id: i64,
    total: i32,
    available: i32,
}
impl InventoryRecord {
    fn to_domain(self) -> PortResult<Inventory> {
        Ok(Inventory {
            book_id: stored_id(self.book_id, BookId::new)?,
            total: self.total,
            available: self.available,
        })
    }
}

#[derive(FromRow)]
struct LoanRecord {
    id: i64,
    user_id: i64,
    book_id: i64,
    status: String,
    borrow_date: DateTime<Utc>,
    due_date: DateTime<Utc>,
    return_date: Option<DateTime<Utc>>,
}
impl LoanRecord {
    fn to_domain(self) -> PortResult<BorrowRecord> {
        let status = BorrowStatus::parse(&self.status)
            .ok_or_else(|| corrupt("borrow status", &self.status))?;
        Ok(BorrowRecord {
            id: self.id,
            user_id: stored_id(self.user_id, UserId::new)?,
            book_id: stored_id(self.book_id, BookId::new)?,
            status,
            borrow_date: self.borrow_date,
            due_date: self.due_date,
            return_date: self.return_date,
        })
    }
}

#[derive(FromRow)]
struct ActiveBorrowRecord {
    record_id: i64,
    borrow_date: DateTime<Utc>,
    due_date: DateTime<Utc>,
    #[sqlx(flatten)]
    book: BookRecord,
}
impl ActiveBorrowRecord {
    fn to_domain(self, now: DateTime<Utc>) -> PortResult<ActiveBorrow> {
        Ok(ActiveBorrow {
            record_id: self.record_id,
            book: self.book.to_domain()?,
            borrow_date: self.borrow_date,
            due_date: self.due_date,
            overdue: now > self.due_date,
        })
    }
}

#[derive(FromRow)]
struct LogRecord {
    id: i64,
    user_id: i64,
    book_id: i64,
    kind: String,
    occurred_at: DateTime<Utc>,
}
impl LogRecord {
    fn to_domain(self) -> PortResult<TransactionLogEntry> {
        let kind =
            TransactionType::parse(&self.kind).ok_or_else(|| corrupt("log kind", &self.kind))?;
        Ok(TransactionLogEntry {
            id: self.id,
            user_id: stored_id(self.user_id, UserId::new)?,
            book_id: stored_id(self.book_id, BookId::new)?,
            kind,
            occurred_at: self.occurred_at,
        })
    }
}

const LOAN_COLUMNS: &str = "id, user_id, book_id, status, borrow_date, due_date, return_date";

//=========================================================================================
// `CirculationStorage` and `CirculationReader` Trait Implementations
//=========================================================================================

#[async_trait]
impl CirculationStorage for DbAdapter {
    async fn begin(&self) -> PortResult<Box<dyn UnitOfWork>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin transaction", e))?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

#[async_trait]
impl CirculationReader for DbAdapter {
    async fn inventory(&self, book_id: BookId) -> PortResult<Inventory> {
        let record = sqlx::query_as::<_, InventoryRecord>(
            "SELECT book_id, total, available FROM inventory WHERE book_id = $1",
        )
        .bind(book_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("read inventory", e))?
        .ok_or_else(|| PortError::NotFound(format!("inventory for book {}", book_id)))?;
        record.to_domain()
    }

    async fn active_borrows(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> PortResult<Vec<ActiveBorrow>> {
        let records = sqlx::query_as::<_, ActiveBorrowRecord>(
            r#"
            SELECT
                r.id AS record_id,
                r.borrow_date,
                r.due_date,
                b.id,
                b.title,
                b.author,
                b.isbn,
                b.category_id,
                b.publisher,
                b.status
            FROM borrow_records r
            JOIN books b ON b.id = r.book_id
            WHERE r.user_id = $1 AND r.status = 'BORROWED'
            ORDER BY r.borrow_date ASC, r.id ASC
            "#,
        )
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list active borrows", e))?;

        records.into_iter().map(|r| r.to_domain(now)).collect()
    }

    fn transactions(&self, page: LogPage) -> LogStream {
        let pool = self.pool.clone();
        Box::pin(stream! {
            // LIMIT NULL means no limit.
            let mut rows = sqlx::query_as::<_, LogRecord>(
                r#"
                SELECT id, user_id, book_id, kind, occurred_at
                FROM transaction_log
                ORDER BY occurred_at DESC, id DESC
                LIMIT $1 OFFSET $2
                "#,
            )
            .bind(page.limit.map(i64::from))
            .bind(i64::from(page.offset))
            .fetch(&pool);

            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => {
                        yield row.to_domain();
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(map_sqlx_error("list transactions", e));
                        break;
                    }
                }
            }
        })
    }
}

//=========================================================================================
// The Unit of Work
//=========================================================================================

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Directory for PgUnitOfWork {
    async fn find_user(&mut self, user_id: UserId) -> PortResult<Option<User>> {
        sqlx::query_as::<_, UserRecord>("SELECT id, role FROM users WHERE id = $1")
            .bind(user_id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find user", e))?
            .map(UserRecord::to_domain)
            .transpose()
    }

    async fn find_book(&mut self, book_id: BookId) -> PortResult<Option<Book>> {
        sqlx::query_as::<_, BookRecord>(
            "SELECT id, title, author, isbn, category_id, publisher, status FROM books WHERE id = $1",
        )
        .bind(book_id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find book", e))?
        .map(BookRecord::to_domain)
        .transpose()
    }
}

#[async_trait]
impl InventoryStore for PgUnitOfWork {
    async fn get(&mut self, book_id: BookId) -> PortResult<Inventory> {
        sqlx::query_as::<_, InventoryRecord>(
            "SELECT book_id, total, available FROM inventory WHERE book_id = $1 FOR UPDATE",
        )
        .bind(book_id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock inventory", e))?
        .ok_or_else(|| PortError::NotFound(format!("inventory for book {}", book_id)))?
        .to_domain()
    }

    async fn decrement_available(&mut self, book_id: BookId) -> PortResult<Inventory> {
        sqlx::query_as::<_, InventoryRecord>(
            r#"
            UPDATE inventory SET available = available - 1
            WHERE book_id = $1 AND available > 0
            RETURNING book_id, total, available
            "#,
        )
        .bind(book_id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("decrement inventory", e))?
        .ok_or(PortError::OutOfStock)?
        .to_domain()
    }

    async fn increment_available(&mut self, book_id: BookId) -> PortResult<Inventory> {
        let updated = sqlx::query_as::<_, InventoryRecord>(
            r#"
            UPDATE inventory SET available = available + 1
            WHERE book_id = $1 AND available < total
            RETURNING book_id, total, available
            "#,
        )
        .bind(book_id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("increment inventory", e))?;

        match updated {
            Some(record) => record.to_domain(),
            None => {
                // Either the row is missing or every copy is already on the shelf.
                let current = self.get(book_id).await?;
                Err(PortError::InvariantViolation(format!(
                    "book {} already has all {} copies available",
                    book_id, current.total
                )))
            }
        }
    }
}

#[async_trait]
impl BorrowRecordStore for PgUnitOfWork {
    async fn lock_user_records(&mut self, user_id: UserId) -> PortResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(user_id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock member loans", e))?;
        Ok(())
    }

    async fn find_active(
        &mut self,
        user_id: UserId,
        book_id: BookId,
    ) -> PortResult<Option<BorrowRecord>> {
        let sql = format!(
            "SELECT {} FROM borrow_records WHERE user_id = $1 AND book_id = $2 AND status = 'BORROWED'",
            LOAN_COLUMNS
        );
        sqlx::query_as::<_, LoanRecord>(&sql)
            .bind(user_id.get())
            .bind(book_id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find active borrow", e))?
            .map(LoanRecord::to_domain)
            .transpose()
    }

    async fn count_active(&mut self, user_id: UserId) -> PortResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM borrow_records WHERE user_id = $1 AND status = 'BORROWED'",
        )
        .bind(user_id.get())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("count active borrows", e))
    }

    async fn create(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        borrow_date: DateTime<Utc>,
        due_date: DateTime<Utc>,
    ) -> PortResult<BorrowRecord> {
        let sql = format!(
            r#"
            INSERT INTO borrow_records (user_id, book_id, status, borrow_date, due_date)
            VALUES ($1, $2, 'BORROWED', $3, $4)
            RETURNING {}
            "#,
            LOAN_COLUMNS
        );
        sqlx::query_as::<_, LoanRecord>(&sql)
            .bind(user_id.get())
            .bind(book_id.get())
            .bind(borrow_date)
            .bind(due_date)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("create borrow record", e))?
            .to_domain()
    }

    async fn close_active(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        return_date: DateTime<Utc>,
    ) -> PortResult<BorrowRecord> {
        let sql = format!(
            r#"
            UPDATE borrow_records SET status = 'RETURNED', return_date = $3
            WHERE user_id = $1 AND book_id = $2 AND status = 'BORROWED'
            RETURNING {}
            "#,
            LOAN_COLUMNS
        );
        sqlx::query_as::<_, LoanRecord>(&sql)
            .bind(user_id.get())
            .bind(book_id.get())
            .bind(return_date)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("close borrow record", e))?
            .ok_or(PortError::NoActiveRecord)?
            .to_domain()
    }
}

#[async_trait]
impl TransactionLog for PgUnitOfWork {
    async fn append(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        kind: TransactionType,
        occurred_at: DateTime<Utc>,
    ) -> PortResult<TransactionLogEntry> {
        sqlx::query_as::<_, LogRecord>(
            r#"
            INSERT INTO transaction_log (user_id, book_id, kind, occurred_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, book_id, kind, occurred_at
            "#,
        )
        .bind(user_id.get())
        .bind(book_id.get())
        .bind(kind.as_str())
        .bind(occurred_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append transaction log", e))?
        .to_domain()
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(self: Box<Self>) -> PortResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> PortResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;

    /// A server-side error carrying only a SQLSTATE.
    #[derive(Debug, thiserror::Error)]
    #[error("{message}")]
    struct PgFailure {
        code: &'static str,
        message: String,
    }

    impl DatabaseError for PgFailure {
        fn message(&self) -> &str {
            &self.message
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            match self.code {
                "23505" => ErrorKind::UniqueViolation,
                "23514" => ErrorKind::CheckViolation,
                _ => ErrorKind::Other,
            }
        }
    }

    fn pg_error(code: &'static str, message: &str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(PgFailure {
            code,
            message: message.to_string(),
        }))
    }

    #[test]
    fn unique_violation_becomes_duplicate() {
        let err = map_sqlx_error(
            "create borrow record",
            pg_error("23505", "duplicate key value violates unique constraint"),
        );
        assert_eq!(
            err,
            PortError::Duplicate(
                "create borrow record: duplicate key value violates unique constraint".to_string()
            )
        );
    }

    #[test]
    fn check_violation_becomes_invariant_violation() {
        let err = map_sqlx_error(
            "increment available",
            pg_error("23514", "new row violates check constraint \"inventory_bounds\""),
        );
        assert!(
            matches!(err, PortError::InvariantViolation(msg) if msg.contains("inventory_bounds"))
        );
    }

    #[test]
    fn serialization_failures_and_deadlocks_are_conflicts() {
        for code in ["40001", "40P01"] {
            let err = map_sqlx_error("commit", pg_error(code, "could not serialize access"));
            assert!(matches!(err, PortError::Conflict(_)), "{} gave {:?}", code, err);
        }
    }

    #[test]
    fn other_server_errors_are_unexpected() {
        let missing = pg_error("42P01", "relation \"books\" does not exist");
        let err = map_sqlx_error("find book", missing);
        assert!(matches!(err, PortError::Unexpected(msg) if msg.starts_with("find book")));
    }

    #[test]
    fn row_not_found_becomes_not_found() {
        let err = map_sqlx_error("find user", sqlx::Error::RowNotFound);
        assert_eq!(err, PortError::NotFound("find user".to_string()));
    }

    #[test]
    fn pool_failures_are_unexpected() {
        let err = map_sqlx_error("begin transaction", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, PortError::Unexpected(msg) if msg.starts_with("begin transaction")));
    }

    #[test]
    fn stored_ids_must_still_be_valid() {
        assert!(matches!(
            stored_id(0, UserId::new),
            Err(PortError::InvariantViolation(_))
        ));
        assert_eq!(stored_id(4, BookId::new).map(BookId::get), Ok(4));
    }
}
