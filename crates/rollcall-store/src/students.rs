//! Student registry and embedding records.

use crate::db::{is_constraint_violation, Store, StoreError};
use crate::models::{EmbeddingRecord, NewStudent, Student, StudentOrder, StudentUpdate};
use rollcall_core::names;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};

const STUDENT_COLUMNS: &str = "id, full_name, roll_no, mobile, email, image_folder";

pub(crate) fn decode_student_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    let folder: String = row.get(5)?;
    Ok(Student {
        id: row.get(0)?,
        full_name: row.get(1)?,
        roll_no: row.get(2)?,
        mobile: row.get(3)?,
        email: row.get(4)?,
        image_folder: PathBuf::from(folder),
    })
}

fn decode_embedding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingRecord> {
    let path: String = row.get(3)?;
    Ok(EmbeddingRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        file_name: row.get(2)?,
        embedding_path: PathBuf::from(path),
    })
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// An embedding record with the current name of its student.
#[derive(Debug, Clone)]
pub struct LabeledRecord {
    pub record: EmbeddingRecord,
    pub full_name: String,
}

impl Store {
    pub fn add_student(&self, student: &NewStudent) -> Result<Student, StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO students (full_name, roll_no, mobile, email, image_folder)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                student.full_name.trim(),
                student.roll_no.trim(),
                student.mobile,
                student.email,
                path_text(&student.image_folder),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::DuplicateRollNo(student.roll_no.trim().to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.conn.last_insert_rowid();
        tracing::info!(id, name = %student.full_name, roll_no = %student.roll_no, "student added");
        self.get_student(id)
    }

    pub fn get_student(&self, id: i64) -> Result<Student, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
                params![id],
                decode_student_row,
            )
            .optional()?
            .ok_or(StoreError::StudentNotFound(id))
    }

    pub fn list_students(&self, order: StudentOrder) -> Result<Vec<Student>, StoreError> {
        let order_by = match order {
            StudentOrder::Name => "full_name COLLATE NOCASE, roll_no",
            StudentOrder::RollNo => "roll_no, full_name",
        };
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY {order_by}"))?;
        let rows = stmt.query_map([], decode_student_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// First student (lowest id) whose name normalizes to the same label.
    pub fn find_student_by_name(&self, name: &str) -> Result<Option<Student>, StoreError> {
        if names::label_for(name).is_empty() {
            return Ok(None);
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY id"))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let student = decode_student_row(row)?;
            if names::same_student(&student.full_name, name) {
                return Ok(Some(student));
            }
        }
        Ok(None)
    }

    pub fn update_student(&self, id: i64, update: &StudentUpdate) -> Result<Student, StoreError> {
        let current = self.get_student(id)?;
        if update.is_empty() {
            return Ok(current);
        }

        let full_name = update
            .full_name
            .as_deref()
            .map(str::trim)
            .unwrap_or(&current.full_name);
        let roll_no = update
            .roll_no
            .as_deref()
            .map(str::trim)
            .unwrap_or(&current.roll_no);
        let mobile = update.mobile.as_ref().or(current.mobile.as_ref());
        let email = update.email.as_ref().or(current.email.as_ref());
        let folder = update.image_folder.as_ref().unwrap_or(&current.image_folder);

        let updated = self.conn.execute(
            "UPDATE students
             SET full_name = ?2, roll_no = ?3, mobile = ?4, email = ?5, image_folder = ?6
             WHERE id = ?1",
            params![id, full_name, roll_no, mobile, email, path_text(folder)],
        );
        match updated {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::DuplicateRollNo(roll_no.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(id, name = %full_name, roll_no = %roll_no, "student updated");
        self.get_student(id)
    }

    /// Delete the student, cascading to ledger rows and embedding records,
    /// and remove the embedding artifact files.
    pub fn delete_student(&self, id: i64) -> Result<Student, StoreError> {
        let student = self.get_student(id)?;
        let records = self.embedding_records_for(id)?;
        self.conn
            .execute("DELETE FROM students WHERE id = ?1", params![id])?;
        remove_artifacts(&records);
        tracing::info!(id, name = %student.full_name, artifacts = records.len(), "student deleted");
        Ok(student)
    }

    pub fn add_embedding_record(
        &self,
        student_id: i64,
        file_name: &str,
        embedding_path: &Path,
    ) -> Result<EmbeddingRecord, StoreError> {
        self.conn.execute(
            "INSERT INTO face_embeddings (student_id, file_name, embedding_path)
             VALUES (?1, ?2, ?3)",
            params![student_id, file_name, path_text(embedding_path)],
        )?;
        Ok(EmbeddingRecord {
            id: self.conn.last_insert_rowid(),
            student_id,
            file_name: file_name.to_string(),
            embedding_path: embedding_path.to_path_buf(),
        })
    }

    pub fn embedding_records_for(&self, student_id: i64) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, student_id, file_name, embedding_path
             FROM face_embeddings WHERE student_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![student_id], decode_embedding_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every embedding record joined with its student's current name.
    pub fn labeled_embedding_records(&self) -> Result<Vec<LabeledRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT e.id, e.student_id, e.file_name, e.embedding_path, s.full_name
             FROM face_embeddings e JOIN students s ON s.id = e.student_id
             ORDER BY e.student_id, e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LabeledRecord {
                record: decode_embedding_row(row)?,
                full_name: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop the student's embedding records and artifact files; returns
    /// how many records were removed.
    pub fn clear_embeddings(&self, student_id: i64) -> Result<usize, StoreError> {
        let records = self.embedding_records_for(student_id)?;
        self.conn.execute(
            "DELETE FROM face_embeddings WHERE student_id = ?1",
            params![student_id],
        )?;
        remove_artifacts(&records);
        Ok(records.len())
    }
}

fn remove_artifacts(records: &[EmbeddingRecord]) {
    for record in records {
        match std::fs::remove_file(&record.embedding_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %record.embedding_path.display(),
                error = %e,
                "failed to remove embedding artifact"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn new_student(name: &str, roll_no: &str) -> NewStudent {
        NewStudent {
            full_name: name.to_string(),
            roll_no: roll_no.to_string(),
            mobile: None,
            email: Some(format!("{roll_no}@school.test")),
            image_folder: PathBuf::from(format!("/srv/images/{name}")),
        }
    }

    #[test]
    fn test_add_and_get_student() {
        let store = Store::open_in_memory().unwrap();
        let s = store.add_student(&new_student("  Divy Tank ", "21CE001")).unwrap();
        assert_eq!(s.full_name, "Divy Tank");
        assert_eq!(store.get_student(s.id).unwrap(), s);
    }

    #[test]
    fn test_duplicate_roll_no_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.add_student(&new_student("Divy Tank", "21CE001")).unwrap();
        let err = store
            .add_student(&new_student("Someone Else", "21CE001"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRollNo(r) if r == "21CE001"));
    }

    #[test]
    fn test_update_to_taken_roll_no_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.add_student(&new_student("A One", "1")).unwrap();
        let b = store.add_student(&new_student("B Two", "2")).unwrap();
        let update = StudentUpdate {
            roll_no: Some("1".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.update_student(b.id, &update),
            Err(StoreError::DuplicateRollNo(_))
        ));
    }

    #[test]
    fn test_update_keeps_unset_fields() {
        let store = Store::open_in_memory().unwrap();
        let s = store.add_student(&new_student("Divy Tank", "7")).unwrap();
        let updated = store
            .update_student(
                s.id,
                &StudentUpdate {
                    mobile: Some("555-0101".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.full_name, "Divy Tank");
        assert_eq!(updated.mobile.as_deref(), Some("555-0101"));
        assert_eq!(updated.email, s.email);
    }

    #[test]
    fn test_list_orders() {
        let store = Store::open_in_memory().unwrap();
        store.add_student(&new_student("zed", "1")).unwrap();
        store.add_student(&new_student("Amy", "2")).unwrap();
        let by_name: Vec<_> = store
            .list_students(StudentOrder::Name)
            .unwrap()
            .into_iter()
            .map(|s| s.full_name)
            .collect();
        assert_eq!(by_name, ["Amy", "zed"]);
        let by_roll: Vec<_> = store
            .list_students(StudentOrder::RollNo)
            .unwrap()
            .into_iter()
            .map(|s| s.roll_no)
            .collect();
        assert_eq!(by_roll, ["1", "2"]);
    }

    #[test]
    fn test_find_by_name_is_case_and_space_insensitive() {
        let store = Store::open_in_memory().unwrap();
        let s = store.add_student(&new_student("Divy Tank", "1")).unwrap();
        assert_eq!(store.find_student_by_name("divy_tank").unwrap(), Some(s.clone()));
        assert_eq!(store.find_student_by_name("  DIVY   tank").unwrap(), Some(s));
        assert_eq!(store.find_student_by_name("divy").unwrap(), None);
        assert_eq!(store.find_student_by_name("   ").unwrap(), None);
    }

    #[test]
    fn test_delete_removes_rows_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let s = store.add_student(&new_student("Divy Tank", "1")).unwrap();
        let artifact = dir.path().join("divy_tank_1.json");
        std::fs::write(&artifact, "{}").unwrap();
        store.add_embedding_record(s.id, "divy_tank_1.json", &artifact).unwrap();
        store
            .initialize_day(
                chrono::NaiveDate::from_ymd_opt(2025, 10, 1).unwrap(),
                chrono::NaiveDate::from_ymd_opt(2025, 10, 1)
                    .unwrap()
                    .and_hms_opt(8, 0, 0)
                    .unwrap(),
            )
            .unwrap();

        store.delete_student(s.id).unwrap();

        assert!(!artifact.exists());
        assert!(store.labeled_embedding_records().unwrap().is_empty());
        let rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
        assert!(matches!(
            store.get_student(s.id),
            Err(StoreError::StudentNotFound(_))
        ));
    }

    #[test]
    fn test_labeled_records_use_current_name() {
        let store = Store::open_in_memory().unwrap();
        let s = store.add_student(&new_student("Old Name", "1")).unwrap();
        store
            .add_embedding_record(s.id, "old_name_1.json", Path::new("/tmp/old_name_1.json"))
            .unwrap();
        store
            .update_student(
                s.id,
                &StudentUpdate {
                    full_name: Some("New Name".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let labeled = store.labeled_embedding_records().unwrap();
        assert_eq!(labeled.len(), 1);
        assert_eq!(labeled[0].full_name, "New Name");
    }

    #[test]
    fn test_duplicate_embedding_file_name_rejected() {
        let store = Store::open_in_memory().unwrap();
        let s = store.add_student(&new_student("A", "1")).unwrap();
        store.add_embedding_record(s.id, "a_1.json", Path::new("/x/a_1.json")).unwrap();
        assert!(store
            .add_embedding_record(s.id, "a_1.json", Path::new("/x/a_1.json"))
            .is_err());
    }
}
