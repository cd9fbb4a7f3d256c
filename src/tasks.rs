use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::ident::normalize_id;
use crate::resolve::{
    dedup_assignments, resolve_assignment, AssignmentRecord, Diagnostics, LinkRecord,
    MissingStaffJoin, ResolvedAssignment, SubjectCatalog, SubjectRecord,
};

#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Pending,
    Completed,
}

/// One feedback obligation as consumed by the UI and report layers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub assignment_id: String,
    pub faculty_name: String,
    pub subject_name: String,
    pub subject_id: String,
    pub academic_year_id: Option<String>,
    pub semester: String,
    pub status: TaskStatus,
}

/// Full ungrouped resolution for one student. Both output modes derive from
/// this, so it is also what the read-through cache holds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    pub student_id: String,
    pub department_id: String,
    pub academic_year_id: String,
    pub rows: Vec<TaskRow>,
    pub diagnostics: Diagnostics,
}

struct StudentRow {
    department_id: String,
    academic_year_id: String,
}

fn db_err(e: impl std::fmt::Display) -> TaskError {
    TaskError::new("db_query_failed", e.to_string())
}

// Stored ids predate canonicalization, so lookups scan and compare through
// the normalizer instead of matching raw column values in SQL.
fn find_student(conn: &Connection, student_key: &str) -> Result<Option<StudentRow>, TaskError> {
    let mut stmt = conn
        .prepare("SELECT id, department_id, academic_year_id FROM students")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .map_err(db_err)?;
    for row in rows {
        let (id, department_id, academic_year_id) = row.map_err(db_err)?;
        if normalize_id(&id).as_deref() == Some(student_key) {
            return Ok(Some(StudentRow {
                department_id,
                academic_year_id,
            }));
        }
    }
    Ok(None)
}

fn load_subjects(conn: &Connection) -> Result<Vec<SubjectRecord>, TaskError> {
    let mut stmt = conn
        .prepare("SELECT id, name, subject_code, academic_year_id FROM subjects ORDER BY rowid")
        .map_err(db_err)?;
    stmt.query_map([], |r| {
        Ok(SubjectRecord {
            id: r.get(0)?,
            name: r.get(1)?,
            subject_code: r.get(2)?,
            academic_year_id: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

fn load_links(conn: &Connection) -> Result<Vec<LinkRecord>, TaskError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, department_id, subject_id, academic_year_id, subject_code
             FROM department_subject_links
             ORDER BY rowid",
        )
        .map_err(db_err)?;
    stmt.query_map([], |r| {
        Ok(LinkRecord {
            id: r.get(0)?,
            department_id: r.get(1)?,
            subject_id: r.get(2)?,
            academic_year_id: r.get(3)?,
            subject_code: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

fn load_assignments(conn: &Connection) -> Result<Vec<AssignmentRecord>, TaskError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, staff_id, subject_id, department_id, academic_year_id, semester, created_at
             FROM faculty_assignments
             ORDER BY rowid",
        )
        .map_err(db_err)?;
    stmt.query_map([], |r| {
        Ok(AssignmentRecord {
            id: r.get(0)?,
            staff_id: r.get(1)?,
            subject_id: r.get(2)?,
            department_id: r.get(3)?,
            academic_year_id: r.get(4)?,
            semester: r.get(5)?,
            created_at: r.get(6)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

// Canonical staff id -> faculty display name, through the users table.
fn load_staff_names(conn: &Connection) -> Result<HashMap<String, String>, TaskError> {
    let mut users: HashMap<String, String> = HashMap::new();
    let mut stmt = conn.prepare("SELECT id, name FROM users").map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .map_err(db_err)?;
    for row in rows {
        let (id, name) = row.map_err(db_err)?;
        if let Some(id) = normalize_id(&id) {
            users.insert(id, name);
        }
    }

    let mut out: HashMap<String, String> = HashMap::new();
    let mut stmt = conn.prepare("SELECT id, user_id FROM staff").map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .map_err(db_err)?;
    for row in rows {
        let (id, user_id) = row.map_err(db_err)?;
        let (Some(staff_id), Some(user_id)) = (normalize_id(&id), normalize_id(&user_id)) else {
            continue;
        };
        if let Some(name) = users.get(&user_id) {
            out.insert(staff_id, name.clone());
        }
    }
    Ok(out)
}

fn load_completed_assignments(
    conn: &Connection,
    student_key: &str,
) -> Result<HashSet<String>, TaskError> {
    let mut stmt = conn
        .prepare("SELECT student_id, assignment_id FROM feedback")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .map_err(db_err)?;
    let mut out = HashSet::new();
    for row in rows {
        let (student_id, assignment_id) = row.map_err(db_err)?;
        if normalize_id(&student_id).as_deref() != Some(student_key) {
            continue;
        }
        if let Some(assignment_id) = normalize_id(&assignment_id) {
            out.insert(assignment_id);
        }
    }
    Ok(out)
}

/// Resolve the authoritative feedback-task set for one student: candidate
/// assignments for the student's department, canonical subject and year per
/// row, year isolation against the student's own year, dedup, then the
/// staff-name and feedback-status joins.
pub fn resolve_tasks_for_student(
    conn: &Connection,
    student_id: &str,
) -> Result<ResolutionReport, TaskError> {
    let Some(student_key) = normalize_id(student_id) else {
        return Err(TaskError::new("bad_params", "studentId is malformed"));
    };
    let Some(student) = find_student(conn, &student_key)? else {
        return Err(TaskError::new("not_found", "student not found"));
    };
    let Some(department_id) = normalize_id(&student.department_id) else {
        return Err(TaskError::new(
            "student_record_invalid",
            "student department reference is malformed",
        ));
    };
    let Some(student_year) = normalize_id(&student.academic_year_id) else {
        return Err(TaskError::new(
            "student_record_invalid",
            "student academic year reference is malformed",
        ));
    };

    let catalog = SubjectCatalog::build(load_subjects(conn)?, load_links(conn)?);
    let possible: HashSet<String> = catalog
        .possible_subject_ids(&student.department_id)
        .into_iter()
        .collect();

    let all_assignments = load_assignments(conn)?;
    let mut candidates: Vec<&AssignmentRecord> = all_assignments
        .iter()
        .filter(|a| {
            normalize_id(&a.subject_id)
                .map(|sid| possible.contains(&sid))
                .unwrap_or(false)
        })
        .collect();
    if candidates.is_empty() {
        // Departments predating the link table carry ownership directly on
        // the assignment row.
        candidates = all_assignments
            .iter()
            .filter(|a| normalize_id(&a.department_id).as_deref() == Some(department_id.as_str()))
            .collect();
    }

    let mut diagnostics = Diagnostics::default();
    let mut resolved: Vec<ResolvedAssignment> = Vec::new();
    for assignment in candidates {
        let Some(row) = resolve_assignment(&catalog, assignment, &mut diagnostics) else {
            continue;
        };
        if row.academic_year_id != student_year {
            // Another year's offering of a shared subject; not this
            // student's to see.
            continue;
        }
        resolved.push(row);
    }

    let surviving = dedup_assignments(resolved, &mut diagnostics);

    let staff_names = load_staff_names(conn)?;
    let completed = load_completed_assignments(conn, &student_key)?;

    let mut rows = Vec::with_capacity(surviving.len());
    for item in surviving {
        let faculty_name = staff_names.get(&item.staff_id).cloned();
        if faculty_name.is_none() {
            diagnostics.missing_staff.push(MissingStaffJoin {
                assignment_id: item.assignment_id.clone(),
                staff_id: item.staff_id.clone(),
            });
        }
        let status = if completed.contains(&item.assignment_id) {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        };
        rows.push(TaskRow {
            assignment_id: item.assignment_id,
            faculty_name: faculty_name.unwrap_or_default(),
            subject_name: item.subject.subject_name,
            subject_id: item.subject.subject_id,
            academic_year_id: Some(item.academic_year_id),
            semester: item.semester,
            status,
        });
    }

    debug!(
        student = %student_key,
        tasks = rows.len(),
        unresolved = diagnostics.unresolved.len(),
        unknown_year = diagnostics.unknown_year.len(),
        "resolved feedback tasks"
    );

    Ok(ResolutionReport {
        student_id: student_key,
        department_id,
        academic_year_id: student_year,
        rows,
        diagnostics,
    })
}

/// Dashboard view: one row per canonical subject. Faculty names are joined
/// in survivor order; a subject counts Completed only when every underlying
/// assignment is completed.
pub fn group_rows_by_subject(rows: &[TaskRow]) -> Vec<TaskRow> {
    let mut order: Vec<String> = Vec::new();
    let mut by_subject: HashMap<String, TaskRow> = HashMap::new();

    for row in rows {
        match by_subject.get_mut(&row.subject_id) {
            None => {
                order.push(row.subject_id.clone());
                by_subject.insert(row.subject_id.clone(), row.clone());
            }
            Some(agg) => {
                if !row.faculty_name.is_empty() {
                    if agg.faculty_name.is_empty() {
                        agg.faculty_name = row.faculty_name.clone();
                    } else if !agg.faculty_name.split(", ").any(|n| n == row.faculty_name) {
                        agg.faculty_name.push_str(", ");
                        agg.faculty_name.push_str(&row.faculty_name);
                    }
                }
                if row.status == TaskStatus::Pending {
                    agg.status = TaskStatus::Pending;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_subject.remove(&id))
        .collect()
}
