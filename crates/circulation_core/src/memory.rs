//! crates/circulation_core/src/memory.rs
//!
//! An in-memory storage backend implementing every storage port.
//!
//! A unit of work takes an owned lock over the whole state and works on a staged
//! copy, so units of work are fully serialized and a rollback is just dropping
//! the copy. Intended for tests and local development; not optimized for volume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{
    ActiveBorrow, Book, BookId, BookStatus, BorrowRecord, BorrowStatus, Inventory, LogPage, Role,
    TransactionLogEntry, TransactionType, User, UserId,
};
use crate::ports::{
    BorrowRecordStore, CirculationReader, CirculationStorage, Directory, InventoryStore,
    LogStream, PortError, PortResult, TransactionLog, UnitOfWork,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    books: HashMap<BookId, Book>,
    inventory: HashMap<BookId, Inventory>,
    records: Vec<BorrowRecord>,
    log: Vec<TransactionLogEntry>,
}

impl MemoryState {
    fn active_position(&self, user_id: UserId, book_id: BookId) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.user_id == user_id && r.book_id == book_id && r.is_active())
    }

    fn inventory_mut(&mut self, book_id: BookId) -> PortResult<&mut Inventory> {
        self.inventory
            .get_mut(&book_id)
            .ok_or_else(|| PortError::NotFound(format!("inventory for book {}", book_id)))
    }

    fn log_page(&self, page: LogPage) -> Vec<TransactionLogEntry> {
        let mut entries = self.log.clone();
        entries.sort_by_key(|e| Reverse((e.occurred_at, e.id)));
        let limit = page.limit.map_or(usize::MAX, |l| l as usize);
        entries
            .into_iter()
            .skip(page.offset as usize)
            .take(limit)
            .collect()
    }
}

//=========================================================================================
// The Storage Handle
//=========================================================================================

/// Shared handle to the in-memory state. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member, standing in for the identity collaborator.
    pub async fn add_user(&self, user_id: UserId, role: Role) {
        let mut state = self.state.lock().await;
        state.users.insert(user_id, User { id: user_id, role });
    }

    /// Registers a title with `total` copies, all of them available.
    pub async fn add_book(&self, book: Book, total: i32) -> PortResult<()> {
        if total < 0 {
            return Err(PortError::InvariantViolation(format!(
                "book {} cannot own {} copies",
                book.id, total
            )));
        }
        let mut state = self.state.lock().await;
        if state
            .books
            .values()
            .any(|b| b.isbn == book.isbn && b.id != book.id)
        {
            return Err(PortError::Duplicate(format!("isbn {}", book.isbn)));
        }
        state.inventory.insert(
            book.id,
            Inventory {
                book_id: book.id,
                total,
                available: total,
            },
        );
        state.books.insert(book.id, book);
        Ok(())
    }

    /// Soft-deletes a title; its records and log entries stay intact.
    pub async fn retire_book(&self, book_id: BookId) -> PortResult<()> {
        let mut state = self.state.lock().await;
        let book = state
            .books
            .get_mut(&book_id)
            .ok_or_else(|| PortError::NotFound(format!("book {}", book_id)))?;
        book.status = BookStatus::Retired;
        Ok(())
    }

    /// Every record ever created for the pair, oldest first.
    pub async fn records_for(&self, user_id: UserId, book_id: BookId) -> Vec<BorrowRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|r| r.user_id == user_id && r.book_id == book_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CirculationStorage for InMemoryStorage {
    async fn begin(&self) -> PortResult<Box<dyn UnitOfWork>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, staged }))
    }
}

#[async_trait]
impl CirculationReader for InMemoryStorage {
    async fn inventory(&self, book_id: BookId) -> PortResult<Inventory> {
        let state = self.state.lock().await;
        state
            .inventory
            .get(&book_id)
            .copied()
            .ok_or_else(|| PortError::NotFound(format!("inventory for book {}", book_id)))
    }

    async fn active_borrows(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> PortResult<Vec<ActiveBorrow>> {
        let state = self.state.lock().await;
        let mut borrows = state
            .records
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active())
            .map(|r| {
                let book = state
                    .books
                    .get(&r.book_id)
                    .cloned()
                    .ok_or_else(|| PortError::NotFound(format!("book {}", r.book_id)))?;
                Ok(ActiveBorrow {
                    record_id: r.id,
                    book,
                    borrow_date: r.borrow_date,
                    due_date: r.due_date,
                    overdue: r.is_overdue(now),
                })
            })
            .collect::<PortResult<Vec<_>>>()?;
        borrows.sort_by_key(|b| (b.borrow_date, b.record_id));
        Ok(borrows)
    }

    fn transactions(&self, page: LogPage) -> LogStream {
        let state = Arc::clone(&self.state);
        stream::once(async move { state.lock().await.log_page(page) })
            .flat_map(|entries| stream::iter(entries.into_iter().map(Ok)))
            .boxed()
    }
}

//=========================================================================================
// The Unit of Work
//=========================================================================================

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[async_trait]
impl Directory for MemoryUnitOfWork {
    async fn find_user(&mut self, user_id: UserId) -> PortResult<Option<User>> {
        Ok(self.staged.users.get(&user_id).cloned())
    }

    async fn find_book(&mut self, book_id: BookId) -> PortResult<Option<Book>> {
        Ok(self.staged.books.get(&book_id).cloned())
    }
}

#[async_trait]
impl InventoryStore for MemoryUnitOfWork {
    async fn get(&mut self, book_id: BookId) -> PortResult<Inventory> {
        self.staged.inventory_mut(book_id).map(|inv| *inv)
    }

    async fn decrement_available(&mut self, book_id: BookId) -> PortResult<Inventory> {
        let inv = self.staged.inventory_mut(book_id)?;
        if inv.available <= 0 {
            return Err(PortError::OutOfStock);
        }
        inv.available -= 1;
        Ok(*inv)
    }

    async fn increment_available(&mut self, book_id: BookId) -> PortResult<Inventory> {
        let inv = self.staged.inventory_mut(book_id)?;
        if inv.available >= inv.total {
            return Err(PortError::InvariantViolation(format!(
                "book {} already has all {} copies available",
                book_id, inv.total
            )));
        }
        inv.available += 1;
        Ok(*inv)
    }
}

#[async_trait]
impl BorrowRecordStore for MemoryUnitOfWork {
    async fn lock_user_records(&mut self, _user_id: UserId) -> PortResult<()> {
        // The unit of work already holds the whole state.
        Ok(())
    }

    async fn find_active(
        &mut self,
        user_id: UserId,
        book_id: BookId,
    ) -> PortResult<Option<BorrowRecord>> {
        Ok(self
            .staged
            .active_position(user_id, book_id)
            .map(|idx| self.staged.records[idx].clone()))
    }

    async fn count_active(&mut self, user_id: UserId) -> PortResult<i64> {
        let count = self
            .staged
            .records
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active())
            .count();
        Ok(count as i64)
    }

    async fn create(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        borrow_date: DateTime<Utc>,
        due_date: DateTime<Utc>,
    ) -> PortResult<BorrowRecord> {
        if self.staged.active_position(user_id, book_id).is_some() {
            return Err(PortError::Duplicate(format!(
                "active borrow for user {} and book {}",
                user_id, book_id
            )));
        }
        let record = BorrowRecord {
            id: self.staged.records.len() as i64 + 1,
            user_id,
            book_id,
            status: BorrowStatus::Borrowed,
            borrow_date,
            due_date,
            return_date: None,
        };
        self.staged.records.push(record.clone());
        Ok(record)
    }

    async fn close_active(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        return_date: DateTime<Utc>,
    ) -> PortResult<BorrowRecord> {
        let idx = self
            .staged
            .active_position(user_id, book_id)
            .ok_or(PortError::NoActiveRecord)?;
        let record = &mut self.staged.records[idx];
        record.status = BorrowStatus::Returned;
        record.return_date = Some(return_date);
        Ok(record.clone())
    }
}

#[async_trait]
impl TransactionLog for MemoryUnitOfWork {
    async fn append(
        &mut self,
        user_id: UserId,
        book_id: BookId,
        kind: TransactionType,
        occurred_at: DateTime<Utc>,
    ) -> PortResult<TransactionLogEntry> {
        let entry = TransactionLogEntry {
            id: self.staged.log.len() as i64 + 1,
            user_id,
            book_id,
            kind,
            occurred_at,
        };
        self.staged.log.push(entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn commit(self: Box<Self>) -> PortResult<()> {
        let MemoryUnitOfWork { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> PortResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use futures::TryStreamExt;

    fn book(id: i64, isbn: &str) -> Book {
        Book {
            id: BookId::new(id).unwrap(),
            title: format!("Title {}", id),
            author: "Author".to_string(),
            isbn: isbn.to_string(),
            category_id: None,
            publisher: "Publisher".to_string(),
            status: BookStatus::Active,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn dropped_unit_of_work_leaves_no_trace() {
        let storage = InMemoryStorage::new();
        storage.add_book(book(1, "isbn-1"), 2).await.unwrap();
        let book_id = BookId::new(1).unwrap();

        {
            let mut uow = storage.begin().await.unwrap();
            uow.decrement_available(book_id).await.unwrap();
        }

        assert_eq!(storage.inventory(book_id).await.unwrap().available, 2);
    }

    #[tokio::test]
    async fn second_active_record_for_pair_is_rejected() {
        let storage = InMemoryStorage::new();
        let user = UserId::new(1).unwrap();
        let book_id = BookId::new(1).unwrap();

        let mut uow = storage.begin().await.unwrap();
        uow.create(user, book_id, start(), start()).await.unwrap();
        let second = uow.create(user, book_id, start(), start()).await;
        assert!(matches!(second, Err(PortError::Duplicate(_))));
    }

    #[tokio::test]
    async fn increment_never_exceeds_total() {
        let storage = InMemoryStorage::new();
        storage.add_book(book(1, "isbn-1"), 1).await.unwrap();
        let mut uow = storage.begin().await.unwrap();
        let result = uow.increment_available(BookId::new(1).unwrap()).await;
        assert!(matches!(result, Err(PortError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn duplicate_isbn_is_rejected_by_seeding() {
        let storage = InMemoryStorage::new();
        storage.add_book(book(1, "isbn-1"), 1).await.unwrap();
        let result = storage.add_book(book(2, "isbn-1"), 1).await;
        assert!(matches!(result, Err(PortError::Duplicate(_))));
    }

    #[tokio::test]
    async fn log_listing_is_newest_first_with_insertion_tiebreak() {
        let storage = InMemoryStorage::new();
        let user = UserId::new(1).unwrap();
        let book_id = BookId::new(1).unwrap();

        let mut uow = storage.begin().await.unwrap();
        uow.append(user, book_id, TransactionType::Borrow, start())
            .await
            .unwrap();
        uow.append(user, book_id, TransactionType::Return, start())
            .await
            .unwrap();
        uow.append(user, book_id, TransactionType::Borrow, start() + Duration::minutes(1))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let all: Vec<_> = storage
            .transactions(LogPage::all())
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<i64> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let page: Vec<_> = storage
            .transactions(LogPage::recent(1, 1))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, 2);
    }
}
