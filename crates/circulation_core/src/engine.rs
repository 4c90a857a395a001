//! crates/circulation_core/src/engine.rs
//!
//! The circulation engine: borrow and return as atomic, invariant-preserving
//! operations, plus the read views reporting collaborators need.

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::domain::{
    due_date_from, ActiveBorrow, BookId, BorrowReceipt, Inventory, LogPage, ReturnReceipt,
    TransactionLogEntry, TransactionType, UserId, MAX_ACTIVE_BORROWS,
};
use crate::error::{CirculationError, CirculationResult};
use crate::ports::{CirculationReader, CirculationStorage, PortError, UnitOfWork};

/// Log entries as handed to reporting callers.
pub type TransactionStream = BoxStream<'static, CirculationResult<TransactionLogEntry>>;

/// Why a single attempt at a unit of work ended early.
#[derive(Debug)]
enum Failure {
    /// A business rule said no. Never retried.
    Rejected(CirculationError),
    /// The storage layer failed.
    Storage(PortError),
}

impl From<PortError> for Failure {
    fn from(err: PortError) -> Self {
        match err {
            PortError::OutOfStock => Failure::Rejected(CirculationError::OutOfStock),
            PortError::NoActiveRecord => Failure::Rejected(CirculationError::NoActiveRecord),
            PortError::Duplicate(_) => Failure::Rejected(CirculationError::AlreadyHeld),
            PortError::NotFound(what) => Failure::Rejected(CirculationError::NotFound(what)),
            other => Failure::Storage(other),
        }
    }
}

impl From<CirculationError> for Failure {
    fn from(err: CirculationError) -> Self {
        Failure::Rejected(err)
    }
}

fn ensure_consistent(inventory: &Inventory) -> Result<(), Failure> {
    if inventory.is_consistent() {
        Ok(())
    } else {
        Err(Failure::Storage(PortError::InvariantViolation(format!(
            "book {} would hold {} of {} copies available",
            inventory.book_id, inventory.available, inventory.total
        ))))
    }
}

//=========================================================================================
// The Engine
//=========================================================================================

/// Owns the write path to inventory and borrow records.
#[derive(Clone)]
pub struct CirculationEngine {
    storage: Arc<dyn CirculationStorage>,
    reader: Arc<dyn CirculationReader>,
    clock: Arc<dyn Clock>,
}

impl CirculationEngine {
    pub fn new(
        storage: Arc<dyn CirculationStorage>,
        reader: Arc<dyn CirculationReader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            reader,
            clock,
        }
    }

    /// Builds an engine over a backend that provides both ports.
    pub fn with_backend<B>(backend: Arc<B>, clock: Arc<dyn Clock>) -> Self
    where
        B: CirculationStorage + CirculationReader + 'static,
    {
        let storage: Arc<dyn CirculationStorage> = backend.clone();
        let reader: Arc<dyn CirculationReader> = backend;
        Self::new(storage, reader, clock)
    }

    /// Lends one copy of `book_id` to `user_id`.
    #[instrument(skip(self))]
    pub async fn borrow(&self, user_id: i64, book_id: i64) -> CirculationResult<BorrowReceipt> {
        let user_id = UserId::new(user_id)?;
        let book_id = BookId::new(book_id)?;

        let receipt = self
            .with_retry("borrow", || self.attempt_borrow(user_id, book_id))
            .await?;
        info!(
            record_id = receipt.record_id,
            due_date = %receipt.due_date,
            "book borrowed"
        );
        Ok(receipt)
    }

    /// Takes back the copy of `book_id` currently on loan to `user_id`.
    #[instrument(skip(self))]
    pub async fn return_book(
        &self,
        user_id: i64,
        book_id: i64,
    ) -> CirculationResult<ReturnReceipt> {
        let user_id = UserId::new(user_id)?;
        let book_id = BookId::new(book_id)?;

        let receipt = self
            .with_retry("return", || self.attempt_return(user_id, book_id))
            .await?;
        info!(record_id = receipt.record_id, "book returned");
        Ok(receipt)
    }

    pub async fn list_active_borrows_for_user(
        &self,
        user_id: i64,
    ) -> CirculationResult<Vec<ActiveBorrow>> {
        let user_id = UserId::new(user_id)?;
        Ok(self.reader.active_borrows(user_id, self.clock.now()).await?)
    }

    /// Newest entries first; `limit = None` lists everything after `offset`.
    pub fn list_transactions(&self, limit: Option<u32>, offset: u32) -> TransactionStream {
        self.transactions(LogPage { limit, offset })
    }

    pub fn all_transactions(&self) -> TransactionStream {
        self.transactions(LogPage::all())
    }

    pub async fn inventory(&self, book_id: i64) -> CirculationResult<Inventory> {
        let book_id = BookId::new(book_id)?;
        Ok(self.reader.inventory(book_id).await?)
    }

    fn transactions(&self, page: LogPage) -> TransactionStream {
        self.reader
            .transactions(page)
            .map_err(CirculationError::from)
            .boxed()
    }

    //=====================================================================================
    // Units of work
    //=====================================================================================

    /// Runs `attempt`, retrying once on a transient storage conflict.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> CirculationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let mut retried = false;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(Failure::Rejected(err)) => {
                    info!(operation, code = err.code(), reason = %err, "request rejected");
                    return Err(err);
                }
                Err(Failure::Storage(PortError::Conflict(reason))) if !retried => {
                    warn!(operation, %reason, "unit of work conflicted, retrying once");
                    retried = true;
                }
                Err(Failure::Storage(err)) => {
                    if matches!(err, PortError::InvariantViolation(_)) {
                        error!(operation, error = %err, "circulation invariant violated, aborting");
                    } else {
                        error!(operation, error = %err, "storage failure");
                    }
                    return Err(CirculationError::Internal(err.to_string()));
                }
            }
        }
    }

    async fn attempt_borrow(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<BorrowReceipt, Failure> {
        let mut uow = self.storage.begin().await?;
        match borrow_within(&mut *uow, self.clock.as_ref(), user_id, book_id).await {
            Ok(receipt) => {
                uow.commit().await?;
                Ok(receipt)
            }
            Err(failure) => {
                abandon(uow, "borrow").await;
                Err(failure)
            }
        }
    }

    async fn attempt_return(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<ReturnReceipt, Failure> {
        let mut uow = self.storage.begin().await?;
        match return_within(&mut *uow, self.clock.as_ref(), user_id, book_id).await {
            Ok(receipt) => {
                uow.commit().await?;
                Ok(receipt)
            }
            Err(failure) => {
                abandon(uow, "return").await;
                Err(failure)
            }
        }
    }
}

async fn abandon(uow: Box<dyn UnitOfWork>, operation: &'static str) {
    if let Err(err) = uow.rollback().await {
        warn!(operation, error = %err, "rollback failed");
    }
}

async fn borrow_within(
    uow: &mut dyn UnitOfWork,
    clock: &dyn Clock,
    user_id: UserId,
    book_id: BookId,
) -> Result<BorrowReceipt, Failure> {
    if uow.find_user(user_id).await?.is_none() {
        return Err(CirculationError::NotFound(format!("user {}", user_id)).into());
    }

    // Checks below must see every committed loan of this member.
    uow.lock_user_records(user_id).await?;
    let now = clock.now();

    let active = uow.count_active(user_id).await?;
    if active >= MAX_ACTIVE_BORROWS {
        return Err(CirculationError::LimitExceeded(active).into());
    }
    if uow.find_active(user_id, book_id).await?.is_some() {
        return Err(CirculationError::AlreadyHeld.into());
    }

    let book = uow
        .find_book(book_id)
        .await?
        .ok_or_else(|| CirculationError::NotFound(format!("book {}", book_id)))?;
    if !book.is_borrowable() {
        return Err(CirculationError::NotFound(format!(
            "book {} is no longer in circulation",
            book_id
        ))
        .into());
    }

    let inventory = match uow.get(book_id).await {
        Ok(inventory) => inventory,
        Err(PortError::NotFound(_)) => return Err(CirculationError::OutOfStock.into()),
        Err(err) => return Err(err.into()),
    };
    if inventory.available <= 0 {
        return Err(CirculationError::OutOfStock.into());
    }

    let after = uow.decrement_available(book_id).await?;
    ensure_consistent(&after)?;

    let record = uow.create(user_id, book_id, now, due_date_from(now)).await?;
    uow.append(user_id, book_id, TransactionType::Borrow, now).await?;

    Ok(BorrowReceipt {
        record_id: record.id,
        book_id,
        borrow_date: record.borrow_date,
        due_date: record.due_date,
    })
}

async fn return_within(
    uow: &mut dyn UnitOfWork,
    clock: &dyn Clock,
    user_id: UserId,
    book_id: BookId,
) -> Result<ReturnReceipt, Failure> {
    if uow.find_user(user_id).await?.is_none() {
        return Err(CirculationError::NotFound(format!("user {}", user_id)).into());
    }
    uow.lock_user_records(user_id).await?;
    let now = clock.now();

    // Retired titles are still accepted back.
    let record = uow.close_active(user_id, book_id, now).await?;

    let after = uow.increment_available(book_id).await?;
    ensure_consistent(&after)?;

    uow.append(user_id, book_id, TransactionType::Return, now).await?;

    Ok(ReturnReceipt {
        record_id: record.id,
        book_id,
        return_date: now,
    })
}
