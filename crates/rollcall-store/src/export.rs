//! Tabular exports of the ledger, written as CSV.

use crate::db::{Store, StoreError};
use crate::ledger::{month_bounds, weekday_name};
use crate::models::{Student, StudentOrder};
use chrono::NaiveDate;
use serde::Serialize;
use std::path::Path;

/// A titled table of string cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sheet {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    fn new(title: impl Into<String>, headers: &[&str]) -> Self {
        Self {
            title: title.into(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for row in std::iter::once(&self.headers).chain(&self.rows) {
            let line: Vec<String> = row.iter().map(|cell| csv_field(cell)).collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_csv())?;
        tracing::info!(sheet = %self.title, path = %path.display(), rows = self.rows.len(), "sheet written");
        Ok(())
    }
}

fn csv_field(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// One student's month: weekday percentage plus their day-by-day sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyReport {
    pub student: Student,
    pub percentage: f64,
    pub sheet: Sheet,
}

impl Store {
    /// Every student for `date` with Name, Roll No, Date, Day, Status;
    /// students without a row are listed Absent.
    pub fn snapshot_sheet(&self, date: NaiveDate) -> Result<Sheet, StoreError> {
        let mut sheet = Sheet::new(
            format!("Attendance {date}"),
            &["Name", "Roll No", "Date", "Day", "Status"],
        );
        let day = weekday_name(date);
        for entry in self.daily_roster(date)? {
            sheet.push(vec![
                entry.student.full_name,
                entry.student.roll_no,
                date.to_string(),
                day.clone(),
                entry.status.to_string(),
            ]);
        }
        Ok(sheet)
    }

    /// Recorded rows only for `date`: Name, Roll No, Status.
    pub fn day_sheet(&self, date: NaiveDate) -> Result<Sheet, StoreError> {
        let mut sheet = Sheet::new(format!("Attendance {date}"), &["Name", "Roll No", "Status"]);
        for record in self.day_records(date)? {
            sheet.push(vec![record.full_name, record.roll_no, record.status.to_string()]);
        }
        Ok(sheet)
    }

    /// One student's recorded days in a month: Date, Day, Status.
    pub fn student_month_sheet(
        &self,
        student_id: i64,
        year: i32,
        month: u32,
    ) -> Result<Sheet, StoreError> {
        let month_view = self.student_month(student_id, year, month)?;
        let mut sheet = Sheet::new(
            format!("{} {year}-{month:02}", month_view.student.full_name),
            &["Date", "Day", "Status"],
        );
        for record in month_view.records {
            sheet.push(vec![
                record.date.to_string(),
                record.day_of_week,
                record.status.to_string(),
            ]);
        }
        Ok(sheet)
    }

    /// Per-student monthly reports, ordered by roll number.
    pub fn monthly_reports(
        &self,
        year: i32,
        month: u32,
        as_of: NaiveDate,
    ) -> Result<Vec<MonthlyReport>, StoreError> {
        month_bounds(year, month)?;
        let mut reports = Vec::new();
        for student in self.list_students(StudentOrder::RollNo)? {
            let percentage = self.weekday_percentage(student.id, year, month, as_of)?;
            let sheet = self.student_month_sheet(student.id, year, month)?;
            reports.push(MonthlyReport {
                student,
                percentage,
                sheet,
            });
        }
        tracing::info!(year, month, students = reports.len(), "monthly reports built");
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::students::tests::new_student;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 6).unwrap()
    }

    fn store_with(names: &[(&str, &str)]) -> Store {
        let store = Store::open_in_memory().unwrap();
        for (name, roll) in names {
            store.add_student(&new_student(name, roll)).unwrap();
        }
        store
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("Tank, Divy"), "\"Tank, Divy\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_initialized_quiet_day_lists_everyone_absent() {
        let store = store_with(&[("Divy Tank", "2"), ("Asha Rao", "1")]);
        store
            .initialize_day(day(), day().and_hms_opt(8, 0, 0).unwrap())
            .unwrap();

        let sheet = store.snapshot_sheet(day()).unwrap();
        assert_eq!(sheet.headers, ["Name", "Roll No", "Date", "Day", "Status"]);
        assert_eq!(sheet.rows.len(), 2);
        assert!(sheet.rows.iter().all(|r| r[4] == "Absent"));
        assert_eq!(
            sheet.to_csv(),
            "Name,Roll No,Date,Day,Status\n\
             Asha Rao,1,2025-10-06,Monday,Absent\n\
             Divy Tank,2,2025-10-06,Monday,Absent\n"
        );
        assert_eq!(store.day_sheet(day()).unwrap().rows.len(), 2);
    }

    #[test]
    fn test_day_sheet_only_recorded_rows() {
        let store = store_with(&[("Divy Tank", "2"), ("Asha Rao", "1")]);
        store
            .mark_present("divy tank", day().and_hms_opt(9, 0, 0).unwrap())
            .unwrap();
        let sheet = store.day_sheet(day()).unwrap();
        assert_eq!(sheet.rows, [["Divy Tank", "2", "Present"]]);
        // The snapshot still includes the unrecorded student.
        assert_eq!(store.snapshot_sheet(day()).unwrap().rows.len(), 2);
    }

    #[test]
    fn test_monthly_reports() {
        let store = store_with(&[("Divy Tank", "2"), ("Asha Rao", "1")]);
        store
            .mark_present("Asha Rao", day().and_hms_opt(9, 0, 0).unwrap())
            .unwrap();
        let reports = store.monthly_reports(2025, 10, day()).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].student.full_name, "Asha Rao");
        // Oct 1-6 holds four weekdays.
        assert_eq!(reports[0].percentage, 25.0);
        assert_eq!(reports[0].sheet.rows, [["2025-10-06", "Monday", "Present"]]);
        assert_eq!(reports[1].percentage, 0.0);
        assert!(reports[1].sheet.rows.is_empty());
    }

    #[test]
    fn test_write_csv_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&[("Divy Tank", "2")]);
        let path = dir.path().join("exports").join("today.csv");
        store.snapshot_sheet(day()).unwrap().write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Name,Roll No,Date,Day,Status\n"));
    }
}
