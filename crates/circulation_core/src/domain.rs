//! crates/circulation_core/src/domain.rs
//!
//! Defines the pure, core data structures of the circulation desk.
//! These structs are independent of any database or wire format.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CirculationError;

/// The most books a member may hold at once.
pub const MAX_ACTIVE_BORROWS: i64 = 3;

/// Length of a loan, counted from the borrow date.
pub const LOAN_PERIOD_DAYS: i64 = 15;

/// Computes the due date for a loan starting at `borrowed_at`.
pub fn due_date_from(borrowed_at: DateTime<Utc>) -> DateTime<Utc> {
    borrowed_at + Duration::days(LOAN_PERIOD_DAYS)
}

//=========================================================================================
// Identifiers
//=========================================================================================

/// Identifier of a library member, owned by the identity collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

/// Identifier of a catalog title.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(i64);

macro_rules! positive_id {
    ($name:ident, $label:literal) => {
        impl $name {
            /// Validates a raw identifier; only strictly positive values are well-formed.
            pub fn new(raw: i64) -> Result<Self, CirculationError> {
                if raw > 0 {
                    Ok(Self(raw))
                } else {
                    Err(CirculationError::InvalidRequest(format!(
                        "{} must be a positive integer, got {}",
                        $label, raw
                    )))
                }
            }

            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

positive_id!(UserId, "user id");
positive_id!(BookId, "book id");

//=========================================================================================
// Members
//=========================================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// A read-only reference to a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub role: Role,
}

//=========================================================================================
// Catalog
//=========================================================================================

/// Whether a title may still be lent out. Retired titles stay in the catalog
/// so historical records keep resolving.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookStatus {
    Active,
    Retired,
}

impl BookStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(BookStatus::Active),
            "retired" => Some(BookStatus::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub category_id: Option<i64>,
    pub publisher: String,
    pub status: BookStatus,
}

impl Book {
    pub fn is_borrowable(&self) -> bool {
        self.status == BookStatus::Active
    }
}

/// Copy counts for one title. `0 <= available <= total` always holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub book_id: BookId,
    pub total: i32,
    pub available: i32,
}

impl Inventory {
    pub fn is_consistent(&self) -> bool {
        0 <= self.available && self.available <= self.total
    }

    pub fn on_loan(&self) -> i32 {
        self.total - self.available
    }
}

//=========================================================================================
// Loans
//=========================================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BorrowStatus {
    Borrowed,
    Returned,
}

impl BorrowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BorrowStatus::Borrowed => "BORROWED",
            BorrowStatus::Returned => "RETURNED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "BORROWED" => Some(BorrowStatus::Borrowed),
            "RETURNED" => Some(BorrowStatus::Returned),
            _ => None,
        }
    }
}

/// One lending instance of a title to a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowRecord {
    pub id: i64,
    pub user_id: UserId,
    pub book_id: BookId,
    pub status: BorrowStatus,
    pub borrow_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
}

impl BorrowRecord {
    pub fn is_active(&self) -> bool {
        self.status == BorrowStatus::Borrowed
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && now > self.due_date
    }
}

/// An active loan joined with the catalog entry it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveBorrow {
    pub record_id: i64,
    pub book: Book,
    pub borrow_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub overdue: bool,
}

//=========================================================================================
// Audit log
//=========================================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Borrow,
    Return,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Borrow => "BORROW",
            TransactionType::Return => "RETURN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "BORROW" => Some(TransactionType::Borrow),
            "RETURN" => Some(TransactionType::Return),
            _ => None,
        }
    }
}

/// Immutable audit entry. `id` grows monotonically with insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub id: i64,
    pub user_id: UserId,
    pub book_id: BookId,
    pub kind: TransactionType,
    pub occurred_at: DateTime<Utc>,
}

/// A window over the transaction log, newest first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct LogPage {
    pub limit: Option<u32>,
    pub offset: u32,
}

impl LogPage {
    pub fn recent(limit: u32, offset: u32) -> Self {
        Self {
            limit: Some(limit),
            offset,
        }
    }

    pub fn all() -> Self {
        Self::default()
    }
}

//=========================================================================================
// Operation results
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BorrowReceipt {
    pub record_id: i64,
    pub book_id: BookId,
    pub borrow_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReturnReceipt {
    pub record_id: i64,
    pub book_id: BookId,
    pub return_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ids_must_be_positive() {
        assert_eq!(UserId::new(7).map(UserId::get), Ok(7));
        assert!(matches!(
            UserId::new(0),
            Err(CirculationError::InvalidRequest(_))
        ));
        assert!(matches!(
            BookId::new(-3),
            Err(CirculationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn due_date_is_fifteen_days_out() {
        let start = Utc.with_ymd_and_hms(2024, 2, 20, 10, 0, 0).unwrap();
        let due = due_date_from(start);
        assert_eq!(due, Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap());
    }

    #[test]
    fn overdue_only_applies_to_active_loans() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut record = BorrowRecord {
            id: 1,
            user_id: UserId::new(1).unwrap(),
            book_id: BookId::new(1).unwrap(),
            status: BorrowStatus::Borrowed,
            borrow_date: start,
            due_date: due_date_from(start),
            return_date: None,
        };
        let late = start + Duration::days(20);
        assert!(record.is_overdue(late));
        assert!(!record.is_overdue(start + Duration::days(2)));

        record.status = BorrowStatus::Returned;
        record.return_date = Some(late);
        assert!(!record.is_overdue(late));
    }

    #[test]
    fn status_strings_round_trip_through_storage_names() {
        for status in [BorrowStatus::Borrowed, BorrowStatus::Returned] {
            assert_eq!(BorrowStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Role::parse(" Admin "), Some(Role::Admin));
        assert_eq!(BookStatus::parse("deleted"), None);
        assert_eq!(TransactionType::parse("RETURN"), Some(TransactionType::Return));
    }
}
