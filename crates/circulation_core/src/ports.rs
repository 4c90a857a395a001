//! crates/circulation_core/src/ports.rs
//!
//! Defines the storage contracts (traits) the circulation engine runs against.
//! These traits form the boundary of the hexagonal architecture: the engine only
//! ever sees a `UnitOfWork`, and adapters decide how atomicity and isolation are
//! provided (an in-memory lock, a Postgres transaction, ...).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

use crate::domain::{
    ActiveBorrow, Book, BookId, BorrowRecord, Inventory, LogPage, TransactionLogEntry,
    TransactionType, User, UserId,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("No copies available")]
    OutOfStock,
    #[error("No active borrow record")]
    NoActiveRecord,
    /// A storage-level uniqueness guarantee rejected the write.
    #[error("Uniqueness violation: {0}")]
    Duplicate(String),
    /// Transient serialization failure or deadlock; the unit of work may be retried.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// Lazy sequence of log entries, newest first.
pub type LogStream = Pin<Box<dyn Stream<Item = PortResult<TransactionLogEntry>> + Send>>;

//=========================================================================================
// Unit-of-work Ports (Traits)
//=========================================================================================

/// Read accessors for the catalog and identity collaborators.
#[async_trait]
pub trait Directory: Send {
    async fn find_user(&mut self, user_id: UserId) -> PortResult<Option<User>>;

    async fn find_book(&mut self, book_id: BookId) -> PortResult<Option<Book>>;
}

#[async_trait]
pub trait InventoryStore: Send {
    /// Reads the counts for a title and holds them against other writers until
    /// the unit of work ends.
    async fn get(&mut self, book_id: BookId) -> PortResult<Inventory>;

    /// Fails with `OutOfStock` when nothing is available.
    async fn decrement_available(&mut self, book_id: BookId) -> PortResult<Inventory>;

    /// Fails with `InvariantViolation` rather than pushing `available` past `total`.
    async fn increment_available(&mut self, book_id: BookId) -> PortResult<Inventory>;
}

#[async_trait]
pub trait BorrowRecordStore: Send {
    /// Serialises this unit of work against other writers of the member's loans.
    async fn lock_user_records(&mut self, user_id: UserId) -> PortResult<()>;

    async fn find_active(
        &mut self,
        user_id: UserId,
        book_id: BookId,
    ) -> PortResult<Option<BorrowRecord>>;

    /// Counts records in `BORROWED` state only.
    async fn count_active(&mut self, user_id: UserId) -> PortResult<i64>;

    /// Fails with `Duplicate` if the pair already has an active record.
    async fn create(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        borrow_date: DateTime<Utc>,
        due_date: DateTime<Utc>,
    ) -> PortResult<BorrowRecord>;

    /// Moves the active record to `RETURNED`, or fails with `NoActiveRecord`.
    async fn close_active(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        return_date: DateTime<Utc>,
    ) -> PortResult<BorrowRecord>;
}

#[async_trait]
pub trait TransactionLog: Send {
    async fn append(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        kind: TransactionType,
        occurred_at: DateTime<Utc>,
    ) -> PortResult<TransactionLogEntry>;
}

/// One atomic, isolated sequence of reads and writes.
///
/// Nothing written through it is visible to others until `commit` succeeds.
/// Dropping it without committing discards every write.
#[async_trait]
pub trait UnitOfWork: Directory + InventoryStore + BorrowRecordStore + TransactionLog {
    async fn commit(self: Box<Self>) -> PortResult<()>;

    async fn rollback(self: Box<Self>) -> PortResult<()>;
}

/// Opens units of work against a storage backend.
#[async_trait]
pub trait CirculationStorage: Send + Sync {
    async fn begin(&self) -> PortResult<Box<dyn UnitOfWork>>;
}

//=========================================================================================
// Reporting Port
//=========================================================================================

/// Read-only views for reporting collaborators. These run outside any unit of work.
#[async_trait]
pub trait CirculationReader: Send + Sync {
    async fn inventory(&self, book_id: BookId) -> PortResult<Inventory>;

    async fn active_borrows(&self, user_id: UserId, now: DateTime<Utc>)
        -> PortResult<Vec<ActiveBorrow>>;

    /// Ordered by timestamp descending, ties broken by newest insertion first.
    /// Each call starts a fresh sequence.
    fn transactions(&self, page: LogPage) -> LogStream;
}
