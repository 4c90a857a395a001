#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use circulation_core::{
    Book, BookId, BookStatus, CirculationEngine, InMemoryStorage, ManualClock, Role, UserId,
};

pub fn opening_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap()
}

pub fn user(id: i64) -> UserId {
    UserId::new(id).unwrap()
}

pub fn book_id(id: i64) -> BookId {
    BookId::new(id).unwrap()
}

pub fn book(id: i64) -> Book {
    Book {
        id: book_id(id),
        title: format!("Book {}", id),
        author: "Sabahattin Ali".to_string(),
        isbn: format!("978-{:09}", id),
        category_id: Some(1),
        publisher: "YKY".to_string(),
        status: BookStatus::Active,
    }
}

/// An engine over in-memory storage with members 1..=3 and the given titles.
pub struct Desk {
    pub engine: CirculationEngine,
    pub storage: Arc<InMemoryStorage>,
    pub clock: Arc<ManualClock>,
}

impl Desk {
    pub async fn with_books(copies: &[(i64, i32)]) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        for id in 1..=3 {
            storage.add_user(user(id), Role::User).await;
        }
        for &(id, total) in copies {
            storage.add_book(book(id), total).await.unwrap();
        }
        let clock = Arc::new(ManualClock::new(opening_time()));
        let engine = CirculationEngine::with_backend(storage.clone(), clock.clone());
        Self {
            engine,
            storage,
            clock,
        }
    }

    pub async fn available(&self, id: i64) -> i32 {
        self.engine.inventory(id).await.unwrap().available
    }
}
