//! Attendance ledger: at most one row per student per date.
//!
//! Recognition events upsert a Present row; day initialization fills in
//! Absent rows for everyone still missing one. Neither path overwrites the
//! other's decision, so both are safe to repeat.

use crate::db::{Store, StoreError};
use crate::models::{
    AttendanceRecord, AttendanceSource, AttendanceStatus, DayRecord, DaySummary, MarkOutcome,
    MonthSummary, RosterEntry, StudentMonth,
};
use crate::students::decode_student_row;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use rusqlite::params;
use std::collections::HashMap;

const RECORD_COLUMNS: &str = "id, student_id, date, day_of_week, status, timestamp, source";

fn decode_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        date: row.get(2)?,
        day_of_week: row.get(3)?,
        status: row.get(4)?,
        timestamp: row.get(5)?,
        source: row.get(6)?,
    })
}

/// Full English weekday name, as stored in `day_of_week`.
pub fn weekday_name(date: NaiveDate) -> String {
    date.format("%A").to_string()
}

/// First and last day of a calendar month.
pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), StoreError> {
    let invalid = || StoreError::InvalidMonth { year, month };
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(invalid)?;
    Ok((first, next - Duration::days(1)))
}

/// Monday–Friday dates in `[from, to]`.
pub fn weekdays_between(from: NaiveDate, to: NaiveDate) -> u32 {
    from.iter_days()
        .take_while(|d| *d <= to)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .count() as u32
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percentage(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round2(f64::from(numerator) / f64::from(denominator) * 100.0)
    }
}

impl Store {
    /// Apply a recognition event for `name` at `at`.
    ///
    /// An existing row for the day becomes Present with a fresh timestamp;
    /// its source is kept. Unknown names are logged and dropped.
    ///
    /// The insert yields to a row written concurrently by another
    /// connection (e.g. day initialization), which the update then flips.
    pub fn mark_present(&self, name: &str, at: NaiveDateTime) -> Result<MarkOutcome, StoreError> {
        let Some(student) = self.find_student_by_name(name)? else {
            tracing::warn!(name, "recognized name matches no student; not marked");
            return Ok(MarkOutcome::UnknownStudent);
        };
        let date = at.date();

        let inserted = self.conn.execute(
            "INSERT INTO attendance (student_id, date, day_of_week, status, timestamp, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(student_id, date) DO NOTHING",
            params![
                student.id,
                date,
                weekday_name(date),
                AttendanceStatus::Present,
                at,
                AttendanceSource::Camera,
            ],
        )?;
        if inserted > 0 {
            tracing::info!(student = %student.full_name, %date, "marked present");
            return Ok(MarkOutcome::Created {
                student_id: student.id,
            });
        }

        self.conn.execute(
            "UPDATE attendance SET status = ?3, timestamp = ?4
             WHERE student_id = ?1 AND date = ?2",
            params![student.id, date, AttendanceStatus::Present, at],
        )?;
        tracing::debug!(student = %student.full_name, %date, "attendance refreshed");
        Ok(MarkOutcome::Updated {
            student_id: student.id,
        })
    }

    /// Insert an Absent row for every student without one on `date`.
    /// Returns the number of rows created.
    pub fn initialize_day(&self, date: NaiveDate, at: NaiveDateTime) -> Result<usize, StoreError> {
        let created = self.conn.execute(
            "INSERT INTO attendance (student_id, date, day_of_week, status, timestamp, source)
             SELECT s.id, ?1, ?2, ?3, ?4, ?5 FROM students s
             WHERE NOT EXISTS (
                 SELECT 1 FROM attendance a WHERE a.student_id = s.id AND a.date = ?1
             )",
            params![
                date,
                weekday_name(date),
                AttendanceStatus::Absent,
                at,
                AttendanceSource::System,
            ],
        )?;
        tracing::info!(%date, created, "day initialized");
        Ok(created)
    }

    /// Whether day initialization has run for `date`.
    pub fn is_day_initialized(&self, date: NaiveDate) -> Result<bool, StoreError> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM attendance WHERE date = ?1 AND source = ?2)",
            params![date, AttendanceSource::System],
            |row| row.get(0),
        )?)
    }

    pub fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM attendance WHERE date = ?1 ORDER BY student_id"
        ))?;
        let rows = stmt.query_map(params![date], decode_record_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every student by roll number, with missing rows reported as Absent.
    pub fn daily_roster(&self, date: NaiveDate) -> Result<Vec<RosterEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.full_name, s.roll_no, s.mobile, s.email, s.image_folder, a.status
             FROM students s
             LEFT JOIN attendance a ON a.student_id = s.id AND a.date = ?1
             ORDER BY s.roll_no, s.id",
        )?;
        let rows = stmt.query_map(params![date], |row| {
            let status: Option<AttendanceStatus> = row.get(6)?;
            Ok(RosterEntry {
                student: decode_student_row(row)?,
                status: status.unwrap_or(AttendanceStatus::Absent),
                recorded: status.is_some(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Only the rows that exist for `date`, by roll number.
    pub fn day_records(&self, date: NaiveDate) -> Result<Vec<DayRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.full_name, s.roll_no, a.status
             FROM attendance a JOIN students s ON s.id = a.student_id
             WHERE a.date = ?1
             ORDER BY s.roll_no, s.id",
        )?;
        let rows = stmt.query_map(params![date], |row| {
            Ok(DayRecord {
                student_id: row.get(0)?,
                full_name: row.get(1)?,
                roll_no: row.get(2)?,
                status: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Present and Absent counts for every day of the month.
    pub fn monthly_summary(&self, year: i32, month: u32) -> Result<Vec<DaySummary>, StoreError> {
        let (first, last) = month_bounds(year, month)?;
        let mut stmt = self.conn.prepare(
            "SELECT date,
                    SUM(CASE WHEN status = 'Present' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'Absent' THEN 1 ELSE 0 END)
             FROM attendance WHERE date BETWEEN ?1 AND ?2
             GROUP BY date",
        )?;
        let counts = stmt
            .query_map(params![first, last], |row| {
                let date: NaiveDate = row.get(0)?;
                let present: u32 = row.get(1)?;
                let absent: u32 = row.get(2)?;
                Ok((date, (present, absent)))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(first
            .iter_days()
            .take_while(|d| *d <= last)
            .map(|date| {
                let (present, absent) = counts.get(&date).copied().unwrap_or((0, 0));
                DaySummary {
                    date,
                    present,
                    absent,
                }
            })
            .collect())
    }

    fn student_records_between(
        &self,
        student_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM attendance
             WHERE student_id = ?1 AND date BETWEEN ?2 AND ?3
             ORDER BY date"
        ))?;
        let rows = stmt.query_map(params![student_id, from, to], decode_record_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The student's rows for the month with a record-ratio summary.
    pub fn student_month(
        &self,
        student_id: i64,
        year: i32,
        month: u32,
    ) -> Result<StudentMonth, StoreError> {
        let student = self.get_student(student_id)?;
        let (first, last) = month_bounds(year, month)?;
        let records = self.student_records_between(student_id, first, last)?;

        let total = records.len() as u32;
        let present = records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Present)
            .count() as u32;
        Ok(StudentMonth {
            student,
            records,
            summary: MonthSummary {
                total,
                present,
                absent: total - present,
                percentage: percentage(present, total),
            },
        })
    }

    /// Present days over Mon–Fri days, from the 1st through
    /// `min(as_of, month end)`, as a percentage rounded to 2 decimals.
    pub fn weekday_percentage(
        &self,
        student_id: i64,
        year: i32,
        month: u32,
        as_of: NaiveDate,
    ) -> Result<f64, StoreError> {
        let (first, last) = month_bounds(year, month)?;
        let end = as_of.min(last);
        if end < first {
            return Ok(0.0);
        }
        let present: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance
             WHERE student_id = ?1 AND status = ?2 AND date BETWEEN ?3 AND ?4",
            params![student_id, AttendanceStatus::Present, first, end],
            |row| row.get(0),
        )?;
        Ok(percentage(present, weekdays_between(first, end)))
    }

    pub fn present_count(&self, date: NaiveDate) -> Result<u32, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE date = ?1 AND status = ?2",
            params![date, AttendanceStatus::Present],
            |row| row.get(0),
        )?)
    }
}
