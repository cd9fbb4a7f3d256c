use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::ident::normalize_id;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::tasks::{self, ResolutionReport, TaskError};

fn val<T: Serialize>(t: &T) -> serde_json::Value {
    serde_json::to_value(t).unwrap_or(serde_json::Value::Null)
}

fn cached_report(
    state: &mut AppState,
    student_id: &str,
    bypass: bool,
) -> Result<ResolutionReport, TaskError> {
    let Some(key) = normalize_id(student_id) else {
        return Err(TaskError::new("bad_params", "studentId is malformed"));
    };
    if !bypass {
        if let Some(report) = state.task_cache.get(&key) {
            debug!(student = %key, "task cache hit");
            return Ok(report);
        }
        debug!(student = %key, "task cache miss");
    }

    let Some(conn) = state.db.as_ref() else {
        return Err(TaskError::new("no_workspace", "select a workspace first"));
    };
    let report = tasks::resolve_tasks_for_student(conn, student_id)?;
    state.task_cache.put(key, report.clone());
    Ok(report)
}

fn handle_tasks_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let group = req
        .params
        .get("groupBySubject")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let bypass = req
        .params
        .get("bypassCache")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let report = match cached_report(state, student_id, bypass) {
        Ok(r) => r,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let rows = if group {
        tasks::group_rows_by_subject(&report.rows)
    } else {
        report.rows.clone()
    };

    ok(
        &req.id,
        json!({
            "tasks": val(&rows),
            "diagnostics": {
                "unresolvedCount": report.diagnostics.unresolved.len(),
                "unknownYearCount": report.diagnostics.unknown_year.len(),
            }
        }),
    )
}

// Ungrouped rows plus every diagnostic list, for manual reconciliation of
// the underlying data.
fn handle_tasks_submission_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let bypass = req
        .params
        .get("bypassCache")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let report = match cached_report(state, student_id, bypass) {
        Ok(r) => r,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    ok(
        &req.id,
        json!({
            "studentId": report.student_id,
            "departmentId": report.department_id,
            "academicYearId": report.academic_year_id,
            "rows": val(&report.rows),
            "unknownYear": val(&report.diagnostics.unknown_year),
            "unresolved": val(&report.diagnostics.unresolved),
            "ambiguousLinks": val(&report.diagnostics.ambiguous_links),
            "semesterMismatches": val(&report.diagnostics.semester_mismatches),
            "missingStaff": val(&report.diagnostics.missing_staff),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "tasks.forStudent" => Some(handle_tasks_for_student(state, req)),
        "tasks.submissionStatus" => Some(handle_tasks_submission_status(state, req)),
        _ => None,
    }
}
