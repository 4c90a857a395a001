pub mod clock;
pub mod domain;
pub mod engine;
pub mod error;
pub mod memory;
pub mod ports;

pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{
    ActiveBorrow, Book, BookId, BookStatus, BorrowReceipt, BorrowRecord, BorrowStatus, Inventory,
    LogPage, ReturnReceipt, Role, TransactionLogEntry, TransactionType, User, UserId,
    LOAN_PERIOD_DAYS, MAX_ACTIVE_BORROWS,
};
pub use engine::{CirculationEngine, TransactionStream};
pub use error::{CirculationError, CirculationResult};
pub use memory::InMemoryStorage;
pub use ports::{
    BorrowRecordStore, CirculationReader, CirculationStorage, Directory, InventoryStore,
    LogStream, PortError, PortResult, TransactionLog, UnitOfWork,
};
