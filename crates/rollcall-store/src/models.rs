//! Row types for students, embedding records and the attendance ledger.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: i64,
    pub full_name: String,
    pub roll_no: String,
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub image_folder: PathBuf,
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub full_name: String,
    pub roll_no: String,
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub image_folder: PathBuf,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct StudentUpdate {
    pub full_name: Option<String>,
    pub roll_no: Option<String>,
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub image_folder: Option<PathBuf>,
}

impl StudentUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.roll_no.is_none()
            && self.mobile.is_none()
            && self.email.is_none()
            && self.image_folder.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StudentOrder {
    #[default]
    Name,
    RollNo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub student_id: i64,
    pub file_name: String,
    pub embedding_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "Present" => Some(Self::Present),
            "Absent" => Some(Self::Absent),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who wrote a ledger row: day initialization or the camera pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceSource {
    System,
    Camera,
}

impl AttendanceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Camera => "webcam",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "webcam" => Some(Self::Camera),
            _ => None,
        }
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                <$ty>::parse(text).ok_or_else(|| {
                    FromSqlError::Other(
                        format!("unknown {} value: {text}", stringify!($ty)).into(),
                    )
                })
            }
        }
    };
}

text_column!(AttendanceStatus);
text_column!(AttendanceSource);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub student_id: i64,
    pub date: NaiveDate,
    pub day_of_week: String,
    pub status: AttendanceStatus,
    pub timestamp: NaiveDateTime,
    pub source: AttendanceSource,
}

/// Result of a recognition event applied to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarkOutcome {
    UnknownStudent,
    Created { student_id: i64 },
    Updated { student_id: i64 },
}

impl MarkOutcome {
    pub fn student_id(&self) -> Option<i64> {
        match self {
            Self::UnknownStudent => None,
            Self::Created { student_id } | Self::Updated { student_id } => Some(*student_id),
        }
    }
}

/// A student's standing on a date; `recorded` is false when no row exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub student: Student,
    pub status: AttendanceStatus,
    pub recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayRecord {
    pub student_id: i64,
    pub full_name: String,
    pub roll_no: String,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub present: u32,
    pub absent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MonthSummary {
    pub total: u32,
    pub present: u32,
    pub absent: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentMonth {
    pub student: Student,
    pub records: Vec<AttendanceRecord>,
    pub summary: MonthSummary,
}
