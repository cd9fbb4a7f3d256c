use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::ident::normalize_id;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

struct NewAssignment {
    subject_id: String,
    department_id: String,
    academic_year_id: Option<String>,
    created_at: Option<String>,
}

/// Wholesale replacement of a staff member's assignments for one semester:
/// delete the old set, insert the new one, in a single transaction. This is
/// the only write the daemon carries, and it invalidates the task cache.
fn handle_assignments_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(staff_raw) = req.params.get("staffId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing staffId", None);
    };
    let Some(staff_id) = normalize_id(staff_raw) else {
        return err(&req.id, "bad_params", "staffId is malformed", None);
    };
    let Some(semester) = req
        .params
        .get("semester")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return err(&req.id, "bad_params", "missing semester", None);
    };
    let Some(entries) = req.params.get("assignments").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing assignments array", None);
    };

    let mut inserts: Vec<NewAssignment> = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let Some(subject_id) = entry
            .get("subjectId")
            .and_then(|v| v.as_str())
            .and_then(normalize_id)
        else {
            return err(
                &req.id,
                "bad_params",
                format!("assignments[{idx}].subjectId is missing or malformed"),
                None,
            );
        };
        let Some(department_id) = entry
            .get("departmentId")
            .and_then(|v| v.as_str())
            .and_then(normalize_id)
        else {
            return err(
                &req.id,
                "bad_params",
                format!("assignments[{idx}].departmentId is missing or malformed"),
                None,
            );
        };
        let academic_year_id = entry
            .get("academicYearId")
            .and_then(|v| v.as_str())
            .and_then(normalize_id);
        let created_at = entry
            .get("createdAt")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        inserts.push(NewAssignment {
            subject_id,
            department_id,
            academic_year_id,
            created_at,
        });
    }

    // Stored staff ids and semester strings predate canonicalization, so
    // the rows to replace are matched in memory rather than in SQL.
    let semester_key = semester.to_ascii_lowercase();
    let mut stmt = match conn.prepare("SELECT id, staff_id, semester FROM faculty_assignments") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let scanned = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match scanned {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    drop(stmt);
    let delete_ids: Vec<String> = rows
        .into_iter()
        .filter(|(_, staff, sem)| {
            normalize_id(staff).as_deref() == Some(staff_id.as_str())
                && sem.trim().to_ascii_lowercase() == semester_key
        })
        .map(|(id, _, _)| id)
        .collect();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for id in &delete_ids {
        if let Err(e) = tx.execute("DELETE FROM faculty_assignments WHERE id = ?", [id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "faculty_assignments" })),
            );
        }
    }

    for item in &inserts {
        let assignment_id = Uuid::new_v4().to_string();
        let created_at = item
            .created_at
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        if let Err(e) = tx.execute(
            "INSERT INTO faculty_assignments(
                id, staff_id, subject_id, department_id, academic_year_id, semester, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &assignment_id,
                &staff_id,
                &item.subject_id,
                &item.department_id,
                &item.academic_year_id,
                &semester,
                &created_at,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "faculty_assignments" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    // Anything resolved before this write is stale.
    state.task_cache.invalidate_all();

    ok(
        &req.id,
        json!({ "deleted": delete_ids.len(), "inserted": inserts.len() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.replace" => Some(handle_assignments_replace(state, req)),
        _ => None,
    }
}
