//! rollcall-store: SQLite-backed student registry and attendance ledger.
//!
//! One row per (student, date) in the ledger, enforced by a unique index;
//! every write is a single-row statement. The enrollment pipeline lives here
//! too since it persists embedding records and retrains from the full set.

pub mod db;
pub mod enrollment;
pub mod export;
pub mod ledger;
pub mod models;
pub mod students;

pub use db::{Store, StoreError};
pub use enrollment::{retrain, EnrollError, EnrollReport, Enroller, TrainReport};
pub use export::{MonthlyReport, Sheet};
pub use models::{
    AttendanceRecord, AttendanceSource, AttendanceStatus, DayRecord, DaySummary,
    EmbeddingRecord, MarkOutcome, MonthSummary, NewStudent, RosterEntry, Student,
    StudentMonth, StudentOrder, StudentUpdate,
};
