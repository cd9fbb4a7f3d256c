use std::collections::HashMap;

use chrono::DateTime;
use serde::Serialize;
use tracing::warn;

use crate::ident::{normalize_id, normalize_opt};

/// Subject master record as stored. Identifier columns keep whatever
/// representation the writing path used; the catalog normalizes on build.
#[derive(Debug, Clone)]
pub struct SubjectRecord {
    pub id: String,
    pub name: String,
    pub subject_code: String,
    pub academic_year_id: Option<String>,
}

/// Department-subject link row ("junction"). `academic_year_id` is
/// authoritative for this department's offering of the subject;
/// `subject_code` is a denormalized copy that may diverge from the master.
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub id: String,
    pub department_id: String,
    pub subject_id: Option<String>,
    pub academic_year_id: Option<String>,
    pub subject_code: Option<String>,
}

/// Faculty assignment row. `subject_id` may reference either a subject
/// master record or a link row, depending on which write path produced it.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub id: String,
    pub staff_id: String,
    pub subject_id: String,
    pub department_id: String,
    pub academic_year_id: Option<String>,
    pub semester: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone)]
struct CatalogSubject {
    id: String,
    name: String,
    code: String,
    academic_year_id: Option<String>,
}

#[derive(Debug, Clone)]
struct CatalogLink {
    id: String,
    department_id: Option<String>,
    subject_id: Option<String>,
    academic_year_id: Option<String>,
    code: Option<String>,
}

/// Immutable snapshot of subjects and links, indexed by canonical id and by
/// subject code. All resolution runs against one catalog instance, so a
/// fixed snapshot always yields the same answers.
pub struct SubjectCatalog {
    subjects: Vec<CatalogSubject>,
    links: Vec<CatalogLink>,
    subject_by_id: HashMap<String, usize>,
    link_by_id: HashMap<String, usize>,
    links_by_subject: HashMap<String, Vec<usize>>,
    links_by_code: HashMap<String, Vec<usize>>,
}

impl SubjectCatalog {
    pub fn build(subjects: Vec<SubjectRecord>, links: Vec<LinkRecord>) -> Self {
        let mut cat = SubjectCatalog {
            subjects: Vec::new(),
            links: Vec::new(),
            subject_by_id: HashMap::new(),
            link_by_id: HashMap::new(),
            links_by_subject: HashMap::new(),
            links_by_code: HashMap::new(),
        };

        for rec in subjects {
            let Some(id) = normalize_id(&rec.id) else {
                continue;
            };
            let idx = cat.subjects.len();
            cat.subjects.push(CatalogSubject {
                id: id.clone(),
                name: rec.name.trim().to_string(),
                code: rec.subject_code.trim().to_string(),
                academic_year_id: normalize_opt(rec.academic_year_id.as_deref()),
            });
            // Historical imports can leave several master records under one
            // id representation; the first row in table order wins.
            cat.subject_by_id.entry(id).or_insert(idx);
        }

        for rec in links {
            let Some(id) = normalize_id(&rec.id) else {
                continue;
            };
            let idx = cat.links.len();
            let subject_id = normalize_opt(rec.subject_id.as_deref());
            let code = rec
                .subject_code
                .as_ref()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty());
            if let Some(code) = &code {
                cat.links_by_code
                    .entry(code.to_ascii_lowercase())
                    .or_default()
                    .push(idx);
            }
            if let Some(sid) = &subject_id {
                cat.links_by_subject.entry(sid.clone()).or_default().push(idx);
            }
            cat.links.push(CatalogLink {
                id: id.clone(),
                department_id: normalize_id(&rec.department_id),
                subject_id,
                academic_year_id: normalize_opt(rec.academic_year_id.as_deref()),
                code,
            });
            cat.link_by_id.entry(id).or_insert(idx);
        }

        cat
    }

    /// Link ids plus linked subject ids for one department, all canonical.
    /// Assignments historically reference either side of the pair, so the
    /// candidate query has to cover both.
    pub fn possible_subject_ids(&self, department_id: &str) -> Vec<String> {
        let Some(dept) = normalize_id(department_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for link in &self.links {
            if link.department_id.as_deref() != Some(dept.as_str()) {
                continue;
            }
            out.push(link.id.clone());
            if let Some(sid) = &link.subject_id {
                if !out.contains(sid) {
                    out.push(sid.clone());
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ResolvedVia {
    Master,
    Link { link_idx: usize },
}

/// The single canonical identity of a subject offering, independent of
/// whether the assignment reached it through the master record or a link.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalSubject {
    pub subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    /// The master record's own academic year, when one was found.
    pub subject_year: Option<String>,
    via: ResolvedVia,
}

/// Ordered resolution of an assignment's raw `subject_id`:
/// subject master record first, then link row, else unresolved (`None`).
/// The caller records unresolved references; nothing is fabricated here.
pub fn resolve_canonical_subject(
    catalog: &SubjectCatalog,
    raw_subject_id: &str,
) -> Option<CanonicalSubject> {
    let id = normalize_id(raw_subject_id)?;

    if let Some(&idx) = catalog.subject_by_id.get(&id) {
        let s = &catalog.subjects[idx];
        return Some(CanonicalSubject {
            subject_id: s.id.clone(),
            subject_code: s.code.clone(),
            subject_name: s.name.clone(),
            subject_year: s.academic_year_id.clone(),
            via: ResolvedVia::Master,
        });
    }

    if let Some(&idx) = catalog.link_by_id.get(&id) {
        let link = &catalog.links[idx];
        if let Some(&subject_idx) = link
            .subject_id
            .as_ref()
            .and_then(|sid| catalog.subject_by_id.get(sid))
        {
            let s = &catalog.subjects[subject_idx];
            return Some(CanonicalSubject {
                subject_id: s.id.clone(),
                subject_code: s.code.clone(),
                subject_name: s.name.clone(),
                subject_year: s.academic_year_id.clone(),
                via: ResolvedVia::Link { link_idx: idx },
            });
        }
        // Master record lost; the link's denormalized code is all that is
        // left to identify the subject by.
        let code = link.code.clone().unwrap_or_default();
        return Some(CanonicalSubject {
            subject_id: link.subject_id.clone().unwrap_or_else(|| link.id.clone()),
            subject_code: code.clone(),
            subject_name: code,
            subject_year: None,
            via: ResolvedVia::Link { link_idx: idx },
        });
    }

    None
}

/// Effective academic year of an assignment, first non-empty source wins:
/// the assignment's own year, then the subject master record's year, then a
/// link-level year (the resolving link, else links matched by subject id or
/// code, preferring the assignment's department). `None` means unknown; an
/// unknown year is never silently replaced with a guess.
pub fn effective_academic_year(
    catalog: &SubjectCatalog,
    assignment: &AssignmentRecord,
    subject: &CanonicalSubject,
    diagnostics: &mut Diagnostics,
) -> Option<String> {
    if let Some(year) = normalize_opt(assignment.academic_year_id.as_deref()) {
        return Some(year);
    }
    if let Some(year) = subject.subject_year.clone() {
        return Some(year);
    }
    if let ResolvedVia::Link { link_idx } = subject.via {
        if let Some(year) = catalog.links[link_idx].academic_year_id.clone() {
            return Some(year);
        }
    }

    // Match links carrying a year, by subject id first, by code second.
    let mut candidates: Vec<usize> = catalog
        .links_by_subject
        .get(&subject.subject_id)
        .cloned()
        .unwrap_or_default();
    if candidates.is_empty() && !subject.subject_code.is_empty() {
        candidates = catalog
            .links_by_code
            .get(&subject.subject_code.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default();
    }
    candidates.retain(|&idx| catalog.links[idx].academic_year_id.is_some());
    if candidates.is_empty() {
        return None;
    }

    let department = normalize_id(&assignment.department_id);
    let matched = department.as_ref().and_then(|dept| {
        candidates
            .iter()
            .copied()
            .find(|&idx| catalog.links[idx].department_id.as_deref() == Some(dept.as_str()))
    });
    let chosen = matched.unwrap_or(candidates[0]);
    let year = catalog.links[chosen].academic_year_id.clone()?;

    if candidates.len() > 1 {
        // Shared subjects carry one link per department; resolving through
        // them is deterministic but worth flagging for data review.
        let candidate_year_ids: Vec<String> = candidates
            .iter()
            .filter_map(|&idx| catalog.links[idx].academic_year_id.clone())
            .collect();
        warn!(
            assignment = %assignment.id,
            subject_code = %subject.subject_code,
            candidates = candidates.len(),
            matched_department = matched.is_some(),
            "ambiguous shared-subject link resolution"
        );
        diagnostics.ambiguous_links.push(AmbiguousLinkResolution {
            assignment_id: assignment.id.clone(),
            subject_code: subject.subject_code.clone(),
            candidate_year_ids,
            chosen_year_id: year.clone(),
            matched_department: matched.is_some(),
        });
    }

    Some(year)
}

/// Assignment reference that matched neither a subject nor a link. Raw
/// column values are kept verbatim for offline review.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedAssignment {
    pub assignment_id: String,
    pub subject_id: String,
    pub department_id: String,
}

/// Assignment whose year could not be established through any fallback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownYearAssignment {
    pub assignment_id: String,
    pub staff_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub semester: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbiguousLinkResolution {
    pub assignment_id: String,
    pub subject_code: String,
    pub candidate_year_ids: Vec<String>,
    pub chosen_year_id: String,
    pub matched_department: bool,
}

/// Same staff and subject recorded under semester strings that differ only
/// in internal formatting. Reported, never merged: collapsing them could
/// hide genuinely distinct offerings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterFormatMismatch {
    pub staff_id: String,
    pub subject_id: String,
    pub semesters: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingStaffJoin {
    pub assignment_id: String,
    pub staff_id: String,
}

/// Accumulated data-quality findings for one resolution run. None of these
/// abort the run; bad rows degrade to entries here.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub unresolved: Vec<UnresolvedAssignment>,
    pub unknown_year: Vec<UnknownYearAssignment>,
    pub ambiguous_links: Vec<AmbiguousLinkResolution>,
    pub semester_mismatches: Vec<SemesterFormatMismatch>,
    pub missing_staff: Vec<MissingStaffJoin>,
}

/// An assignment row after subject and year resolution, ids canonical.
#[derive(Debug, Clone)]
pub struct ResolvedAssignment {
    pub assignment_id: String,
    pub staff_id: String,
    pub subject: CanonicalSubject,
    pub semester: String,
    pub academic_year_id: String,
    pub created_at: Option<String>,
}

/// Run one assignment through subject and year resolution. `None` means the
/// row was recorded in the diagnostics and must not produce a task.
pub fn resolve_assignment(
    catalog: &SubjectCatalog,
    assignment: &AssignmentRecord,
    diagnostics: &mut Diagnostics,
) -> Option<ResolvedAssignment> {
    let Some(assignment_id) = normalize_id(&assignment.id) else {
        warn!(raw = %assignment.id, "assignment with malformed id skipped");
        return None;
    };

    let Some(subject) = resolve_canonical_subject(catalog, &assignment.subject_id) else {
        warn!(
            assignment = %assignment.id,
            subject_ref = %assignment.subject_id,
            "assignment subject reference is unresolved"
        );
        diagnostics.unresolved.push(UnresolvedAssignment {
            assignment_id: assignment.id.clone(),
            subject_id: assignment.subject_id.clone(),
            department_id: assignment.department_id.clone(),
        });
        return None;
    };

    let staff_id = normalize_id(&assignment.staff_id).unwrap_or_default();
    let semester = assignment.semester.trim().to_string();

    let Some(academic_year_id) =
        effective_academic_year(catalog, assignment, &subject, diagnostics)
    else {
        warn!(
            assignment = %assignment.id,
            subject = %subject.subject_id,
            "assignment has no provable academic year"
        );
        diagnostics.unknown_year.push(UnknownYearAssignment {
            assignment_id: assignment_id.clone(),
            staff_id: staff_id.clone(),
            subject_id: subject.subject_id.clone(),
            subject_name: subject.subject_name.clone(),
            semester: semester.clone(),
        });
        return None;
    };

    Some(ResolvedAssignment {
        assignment_id,
        staff_id,
        subject,
        semester,
        academic_year_id,
        created_at: assignment.created_at.clone(),
    })
}

fn semester_key(semester: &str) -> String {
    semester.trim().to_ascii_lowercase()
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// Parseable timestamps sort before absent or unparseable ones, so the
// earliest known creation time always survives.
fn created_rank(raw: Option<&str>) -> (u8, i64) {
    match raw.and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok()) {
        Some(t) => (0, t.timestamp_millis()),
        None => (1, 0),
    }
}

/// Collapse rows denoting the same (staff, canonical subject, semester)
/// fact to one survivor: earliest `created_at`, ties by input order.
/// Dropped duplicates are expected, not errors. Semester strings that agree
/// only after whitespace collapsing are kept apart and reported.
pub fn dedup_assignments(
    rows: Vec<ResolvedAssignment>,
    diagnostics: &mut Diagnostics,
) -> Vec<ResolvedAssignment> {
    let mut survivors: Vec<ResolvedAssignment> = Vec::new();
    let mut by_key: HashMap<(String, String, String), usize> = HashMap::new();
    let mut semester_variants: HashMap<(String, String), Vec<(String, String)>> = HashMap::new();
    let mut group_order: Vec<(String, String)> = Vec::new();

    for row in rows {
        let sem_key = semester_key(&row.semester);
        let group = (row.staff_id.clone(), row.subject.subject_id.clone());
        let variants = semester_variants.entry(group.clone()).or_insert_with(|| {
            group_order.push(group);
            Vec::new()
        });
        if !variants.iter().any(|(k, _)| *k == sem_key) {
            variants.push((sem_key.clone(), row.semester.clone()));
        }

        let key = (row.staff_id.clone(), row.subject.subject_id.clone(), sem_key);
        match by_key.get(&key) {
            None => {
                by_key.insert(key, survivors.len());
                survivors.push(row);
            }
            Some(&idx) => {
                if created_rank(row.created_at.as_deref())
                    < created_rank(survivors[idx].created_at.as_deref())
                {
                    survivors[idx] = row;
                }
            }
        }
    }

    for group in group_order {
        let Some(variants) = semester_variants.get(&group) else {
            continue;
        };
        for i in 0..variants.len() {
            for j in (i + 1)..variants.len() {
                if collapse_ws(&variants[i].0) == collapse_ws(&variants[j].0) {
                    diagnostics.semester_mismatches.push(SemesterFormatMismatch {
                        staff_id: group.0.clone(),
                        subject_id: group.1.clone(),
                        semesters: vec![variants[i].1.clone(), variants[j].1.clone()],
                    });
                }
            }
        }
    }

    survivors
}
