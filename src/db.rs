use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("feedback.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            abbreviation TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            abbreviation TEXT NOT NULL,
            department_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            academic_year_id TEXT,
            semester TEXT
        )",
        [],
    )?;
    // Subjects predating the link table carried their own year and semester.
    // Workspaces imported from those builds may lack the columns.
    ensure_subjects_semester(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_code ON subjects(subject_code)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS department_subject_links(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            subject_id TEXT,
            academic_year_id TEXT,
            subject_code TEXT
        )",
        [],
    )?;
    ensure_links_subject_code(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_department ON department_subject_links(department_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_subject ON department_subject_links(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            department_id TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staff_department ON staff(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT,
            department_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculty_assignments(
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            department_id TEXT NOT NULL,
            academic_year_id TEXT,
            semester TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;
    ensure_assignments_created_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_staff ON faculty_assignments(staff_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_department ON faculty_assignments(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            assignment_id TEXT NOT NULL,
            ratings TEXT,
            submitted_at TEXT,
            UNIQUE(student_id, assignment_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_student ON feedback(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_assignment ON feedback(assignment_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_subjects_semester(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subjects", "semester")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE subjects ADD COLUMN semester TEXT", [])?;
    Ok(())
}

fn ensure_links_subject_code(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "department_subject_links", "subject_code")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE department_subject_links ADD COLUMN subject_code TEXT",
        [],
    )?;

    // Backfill from the master record where the reference still resolves.
    conn.execute(
        "UPDATE department_subject_links
         SET subject_code = (
           SELECT s.subject_code FROM subjects s
           WHERE s.id = department_subject_links.subject_id
         )
         WHERE subject_code IS NULL",
        [],
    )?;
    Ok(())
}

fn ensure_assignments_created_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "faculty_assignments", "created_at")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE faculty_assignments ADD COLUMN created_at TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
