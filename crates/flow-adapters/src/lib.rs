//! Catalog API source contract, raw API shapes, requisite normalization and record conversion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use flow_core::{
    course_code, expand_number_range, parse_api_timestamp, seconds_from_12h, seconds_since_midnight,
    weekday_code, weekdays_from_pattern, Antirequisite, Course, Exam, Meeting, ParseError,
    Prerequisite, Prof, Section, Term, TermId,
};
use flow_fetch::{ApiClient, BoundedFetcher, FetchError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "flow-adapters";

/// Capacity the API reports for placeholder classes that never run.
pub const PLACEHOLDER_CAPACITY: i32 = 9999;

/// Important-date event names delimiting instruction. The API offers no stable ids for them.
pub const CLASSES_BEGIN_EVENT: &str = "Classes begin";
pub const CLASSES_END_EVENT: &str = "Classes end";

const DEFAULT_EXAM_COMPONENT: &str = "LEC";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{record} is missing {field}")]
    MissingField { record: String, field: &'static str },
    #[error("{record} is a placeholder: {reason}")]
    Placeholder { record: String, reason: String },
    #[error("invalid course code {0:?}")]
    InvalidCode(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unmatched term in {event} event: {term}")]
    UnmatchedTerm { event: &'static str, term: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEvent {
    pub name: String,
    #[serde(default, rename = "details")]
    pub occurrences: Option<Vec<ApiEventOccurrence>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEventOccurrence {
    pub term_name: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCourse {
    pub subject_code: String,
    pub catalog_number: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requirements_description: Option<String>,
}

/// One class (section) from a class schedule response. Instructor data carries no names.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiClass {
    pub class_number: i32,
    #[serde(default)]
    pub course_component: Option<String>,
    pub class_section: i32,
    #[serde(default)]
    pub max_enrollment_capacity: i32,
    #[serde(default)]
    pub enrolled_students: i32,
    #[serde(default)]
    pub term_code: Option<String>,
    #[serde(default)]
    pub schedule_data: Option<Vec<ApiClassSchedule>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiClassSchedule {
    #[serde(default)]
    pub schedule_start_date: Option<String>,
    #[serde(default)]
    pub schedule_end_date: Option<String>,
    #[serde(default)]
    pub class_meeting_start_time: Option<String>,
    #[serde(default)]
    pub class_meeting_end_time: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub class_meeting_week_pattern_code: Option<String>,
    #[serde(default)]
    pub class_meeting_number: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiExam {
    pub course: String,
    #[serde(default)]
    pub sections: Vec<ApiExamSection>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiExamSection {
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub location: String,
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn important_dates(&self) -> Result<Vec<ApiEvent>, FetchError>;

    async fn courses(&self, term: TermId) -> Result<Vec<ApiCourse>, FetchError>;

    /// Classes of one course in one term; a course not offered yields an empty list.
    async fn class_schedules(
        &self,
        term: TermId,
        subject: &str,
        number: &str,
    ) -> Result<Vec<ApiClass>, FetchError>;

    async fn exam_schedule(&self, term: TermId) -> Result<Vec<ApiExam>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct UwApi {
    client: ApiClient,
}

impl UwApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CatalogSource for UwApi {
    async fn important_dates(&self) -> Result<Vec<ApiEvent>, FetchError> {
        self.client.get_v3("ImportantDates").await
    }

    async fn courses(&self, term: TermId) -> Result<Vec<ApiCourse>, FetchError> {
        self.client.get_v3(&format!("Courses/{term}")).await
    }

    async fn class_schedules(
        &self,
        term: TermId,
        subject: &str,
        number: &str,
    ) -> Result<Vec<ApiClass>, FetchError> {
        let endpoint = format!("ClassSchedule/{term}/{subject}/{number}");
        match self.client.get_v3(&endpoint).await {
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    async fn exam_schedule(&self, term: TermId) -> Result<Vec<ApiExam>, FetchError> {
        self.client
            .get_v2(&format!("terms/{term}/examschedule"))
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CourseHandle {
    pub term: TermId,
    pub subject: String,
    pub number: String,
}

#[derive(Debug, Clone)]
pub struct FetchedClasses {
    pub handle: CourseHandle,
    pub classes: Vec<ApiClass>,
}

#[derive(Debug, Default)]
pub struct FetchedCatalog {
    /// Courses across all fetched terms, first listing wins.
    pub courses: Vec<ApiCourse>,
    pub classes: Vec<FetchedClasses>,
    pub failed_terms: Vec<TermId>,
    pub failed_handles: usize,
}

/// Fetches course lists per term, then every course's class schedule under the fetcher's
/// concurrency ceiling.
///
/// A failed course list skips that term; a failed class schedule skips that handle. Only
/// when every term's course list fails is the first failure returned.
pub async fn fetch_catalog(
    source: Arc<dyn CatalogSource>,
    fetcher: &BoundedFetcher,
    terms: &[TermId],
) -> Result<FetchedCatalog, FetchError> {
    let mut catalog = FetchedCatalog::default();
    let mut seen = HashSet::new();
    let mut handles = Vec::new();
    let mut first_error = None;

    for &term in terms {
        match source.courses(term).await {
            Ok(courses) => {
                for course in courses {
                    handles.push(CourseHandle {
                        term,
                        subject: course.subject_code.clone(),
                        number: course.catalog_number.clone(),
                    });
                    if seen.insert((course.subject_code.clone(), course.catalog_number.clone())) {
                        catalog.courses.push(course);
                    }
                }
            }
            Err(err) => {
                warn!(%term, error = %err, "failed to fetch course list, skipping term");
                catalog.failed_terms.push(term);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    if catalog.failed_terms.len() == terms.len() {
        if let Some(err) = first_error {
            return Err(err);
        }
    }

    let report = fetcher
        .fetch_all(handles, |handle| {
            let source = source.clone();
            async move {
                source
                    .class_schedules(handle.term, &handle.subject, &handle.number)
                    .await
            }
        })
        .await;

    for (handle, err) in &report.failures {
        warn!(
            term = %handle.term,
            subject = %handle.subject,
            number = %handle.number,
            error = %err,
            "failed to fetch class schedule, proceeding anyway"
        );
    }
    catalog.failed_handles = report.failures.len();
    catalog.classes = report
        .items
        .into_iter()
        .map(|(handle, classes)| FetchedClasses { handle, classes })
        .collect();
    Ok(catalog)
}

static SUBJECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,}\b").expect("subject pattern"));
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[0-9]{3}[A-Z]*\b").expect("number pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequisiteKind {
    Prereq,
    Coreq,
    Antireq,
}

impl RequisiteKind {
    /// Classifies a label such as `"Prereq/coreq:"`; combined labels count as prereqs.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.to_ascii_lowercase();
        if label.contains("prereq") {
            Some(Self::Prereq)
        } else if label.contains("coreq") {
            Some(Self::Coreq)
        } else if label.contains("antireq") {
            Some(Self::Antireq)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequisiteSegments {
    pub prereqs: Option<String>,
    pub coreqs: Option<String>,
    pub antireqs: Option<String>,
}

impl RequisiteSegments {
    fn slot(&mut self, kind: RequisiteKind) -> &mut Option<String> {
        match kind {
            RequisiteKind::Prereq => &mut self.prereqs,
            RequisiteKind::Coreq => &mut self.coreqs,
            RequisiteKind::Antireq => &mut self.antireqs,
        }
    }
}

struct Label {
    start: usize,
    colon: usize,
    kind: RequisiteKind,
}

/// Splits a requirements description at its requisite labels.
///
/// A label is the run of non-whitespace text ending in a colon, so `"Prereq and Antireq:"`
/// is an antireq label and the words before it stay in the preceding segment. Text before
/// the first label is dropped. Repeated labels of one kind are joined with a space.
pub fn split_requirements(text: &str) -> RequisiteSegments {
    let bytes = text.as_bytes();
    let mut labels = Vec::new();

    for (colon, _) in text.match_indices(':') {
        let start = bytes[..colon]
            .iter()
            .rposition(|b| b.is_ascii_whitespace() || *b == b':')
            .map_or(0, |space| space + 1);
        if let Some(kind) = RequisiteKind::from_label(&text[start..colon]) {
            labels.push(Label { start, colon, kind });
        }
    }

    let mut segments = RequisiteSegments::default();
    for (i, label) in labels.iter().enumerate() {
        let end = labels
            .get(i + 1)
            .map_or(text.len(), |next| next.start)
            .max(label.colon + 1);
        let body = text[label.colon + 1..end].trim();
        if body.is_empty() {
            continue;
        }
        let slot = segments.slot(label.kind);
        match slot {
            Some(existing) => {
                existing.push(' ');
                existing.push_str(body);
            }
            None => *slot = Some(body.to_string()),
        }
    }
    segments
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedCodes {
    pub text: String,
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Subject,
    Number,
}

/// Rewrites course references so every number carries its subject, e.g.
/// `"MATH 235 or 245"` becomes `"MATH235 or MATH245"`.
///
/// Subjects separated only by `/` form a group sharing the next number
/// (`"PHIL/PSYCH 256"`). A number without a preceding subject is left as written.
pub fn expand_course_codes(input: &str) -> ExpandedCodes {
    let mut tokens: Vec<(usize, usize, TokenKind)> = SUBJECT_RE
        .find_iter(input)
        .map(|m| (m.start(), m.end(), TokenKind::Subject))
        .chain(
            NUMBER_RE
                .find_iter(input)
                .map(|m| (m.start(), m.end(), TokenKind::Number)),
        )
        .collect();
    tokens.sort_unstable_by_key(|&(start, _, _)| start);

    let mut text = String::with_capacity(input.len());
    let mut codes = Vec::new();
    let mut written = 0;
    let mut group: Vec<&str> = Vec::new();
    let mut group_start = 0;
    let mut last_subject_end: Option<usize> = None;

    for (start, end, kind) in tokens {
        let token = &input[start..end];
        match kind {
            TokenKind::Subject => {
                let joins_group = last_subject_end.is_some_and(|prev| &input[prev..start] == "/");
                if !joins_group {
                    group.clear();
                    group_start = start;
                }
                group.push(token);
                last_subject_end = Some(end);
            }
            TokenKind::Number => {
                if group.is_empty() {
                    continue;
                }
                // Only spacing or punctuation between subject and number: the pair is one code.
                let replaces_subjects = last_subject_end
                    .is_some_and(|prev| !input[prev..start].chars().any(char::is_alphanumeric));
                let copy_until = if replaces_subjects { group_start } else { start };
                text.push_str(&input[written..copy_until]);
                for (i, subject) in group.iter().enumerate() {
                    if i > 0 {
                        text.push('/');
                    }
                    text.push_str(subject);
                    text.push_str(token);
                    codes.push(course_code(subject, token));
                }
                written = end;
                last_subject_end = None;
            }
        }
    }
    text.push_str(&input[written..]);

    ExpandedCodes { text, codes }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedRequisites {
    pub prereqs: Option<ExpandedCodes>,
    pub coreqs: Option<ExpandedCodes>,
    pub antireqs: Option<ExpandedCodes>,
}

pub fn normalize_requirements(text: Option<&str>) -> NormalizedRequisites {
    let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
        return NormalizedRequisites::default();
    };
    let segments = split_requirements(text);
    NormalizedRequisites {
        prereqs: segments.prereqs.as_deref().map(expand_course_codes),
        coreqs: segments.coreqs.as_deref().map(expand_course_codes),
        antireqs: segments.antireqs.as_deref().map(expand_course_codes),
    }
}

/// Subject codes the catalog has renamed; old codes are rewritten on import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRenames {
    renames: HashMap<String, String>,
}

impl Default for SubjectRenames {
    fn default() -> Self {
        Self::new([("MSCI".to_string(), "MSE".to_string())])
    }
}

impl SubjectRenames {
    pub fn new(renames: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            renames: renames
                .into_iter()
                .map(|(from, to)| (from.trim().to_ascii_uppercase(), to.trim().to_ascii_uppercase()))
                .collect(),
        }
    }

    pub fn canonical_subject(&self, subject: &str) -> String {
        let upper = subject.trim().to_ascii_uppercase();
        self.renames.get(&upper).cloned().unwrap_or(upper)
    }

    pub fn course_code(&self, subject: &str, number: &str) -> String {
        course_code(&self.canonical_subject(subject), number)
    }

    /// Applies renames to an already-lowercased course code such as `msci211`.
    pub fn canonical_code(&self, code: &str) -> String {
        let split = code
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(code.len());
        self.course_code(&code[..split], &code[split..])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedCourse {
    pub course: Course,
    pub prereqs: Vec<Prerequisite>,
    pub antireqs: Vec<Antirequisite>,
}

pub fn convert_course(
    api: &ApiCourse,
    renames: &SubjectRenames,
) -> Result<ConvertedCourse, ConvertError> {
    let code = renames.course_code(&api.subject_code, &api.catalog_number);
    if code.is_empty() {
        return Err(ConvertError::InvalidCode(format!(
            "{}{}",
            api.subject_code, api.catalog_number
        )));
    }

    let requisites = normalize_requirements(api.requirements_description.as_deref());
    let mut prereqs = Vec::new();
    let mut antireqs = Vec::new();
    for (expanded, is_coreq) in [(&requisites.prereqs, false), (&requisites.coreqs, true)] {
        for prereq_code in expanded.iter().flat_map(|e| &e.codes) {
            prereqs.push(Prerequisite {
                course_code: code.clone(),
                prereq_code: renames.canonical_code(prereq_code),
                is_coreq,
            });
        }
    }
    for antireq_code in requisites.antireqs.iter().flat_map(|e| &e.codes) {
        antireqs.push(Antirequisite {
            course_code: code.clone(),
            antireq_code: renames.canonical_code(antireq_code),
        });
    }

    Ok(ConvertedCourse {
        course: Course {
            code,
            name: api.title.trim().to_string(),
            description: non_empty(api.description.as_deref()),
            prereqs: requisites.prereqs.map(|e| e.text),
            coreqs: requisites.coreqs.map(|e| e.text),
            antireqs: requisites.antireqs.map(|e| e.text),
        },
        prereqs,
        antireqs,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedClass {
    pub section: Section,
    pub meetings: Vec<Meeting>,
    pub rejected_meetings: usize,
    pub failed_meetings: usize,
}

// Without `term`, meetings lacking explicit dates are rejected.
pub fn convert_class(
    api: &ApiClass,
    course_code: &str,
    term_id: TermId,
    term: Option<&Term>,
) -> Result<ConvertedClass, ConvertError> {
    let record = format!("class {} of {course_code} in {term_id}", api.class_number);
    if api.max_enrollment_capacity >= PLACEHOLDER_CAPACITY {
        return Err(ConvertError::Placeholder {
            record,
            reason: format!("enrollment capacity {}", api.max_enrollment_capacity),
        });
    }
    let component = api
        .course_component
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(ConvertError::MissingField {
            record: record.clone(),
            field: "course component",
        })?;

    let section = Section {
        course_code: course_code.to_string(),
        class_number: api.class_number,
        section_name: format!("{component} {:03}", api.class_section),
        campus: String::new(),
        enrollment_capacity: api.max_enrollment_capacity,
        enrollment_total: api.enrolled_students,
        term_id,
    };

    let mut meetings = Vec::new();
    let mut rejected_meetings = 0;
    let mut failed_meetings = 0;
    for schedule in api.schedule_data.iter().flatten() {
        match convert_meeting(api.class_number, term_id, term, schedule) {
            Ok(Some(meeting)) => meetings.push(meeting),
            Ok(None) => rejected_meetings += 1,
            Err(err) => {
                warn!(error = %err, %record, "failed to convert meeting");
                rejected_meetings += 1;
                failed_meetings += 1;
            }
        }
    }

    Ok(ConvertedClass {
        section,
        meetings,
        rejected_meetings,
        failed_meetings,
    })
}

/// `Ok(None)` for meeting number 0, which the API emits for rows with unusable data.
pub fn convert_meeting(
    class_number: i32,
    term_id: TermId,
    term: Option<&Term>,
    api: &ApiClassSchedule,
) -> Result<Option<Meeting>, ConvertError> {
    if api.class_meeting_number == 0 {
        return Ok(None);
    }

    let record = format!("meeting {} of class {class_number}", api.class_meeting_number);
    let start_seconds = non_empty(api.class_meeting_start_time.as_deref())
        .map(|t| seconds_since_midnight(&t))
        .transpose()?;
    let end_seconds = non_empty(api.class_meeting_end_time.as_deref())
        .map(|t| seconds_since_midnight(&t))
        .transpose()?;
    let start_date = meeting_date(api.schedule_start_date.as_deref(), term.map(|t| t.start_date))
        .ok_or_else(|| ConvertError::MissingField {
            record: record.clone(),
            field: "start date",
        })??;
    let end_date = meeting_date(api.schedule_end_date.as_deref(), term.map(|t| t.end_date))
        .ok_or_else(|| ConvertError::MissingField {
            record: record.clone(),
            field: "end date",
        })??;
    let days = match non_empty(api.class_meeting_week_pattern_code.as_deref()) {
        Some(pattern) => weekdays_from_pattern(&pattern)?,
        None => Vec::new(),
    };

    Ok(Some(Meeting {
        class_number,
        term_id,
        // Schedule responses carry no instructor names, so meetings stay unlinked.
        prof_code: None,
        location: non_empty(api.location_name.as_deref()),
        is_tba: start_seconds.is_none() || end_seconds.is_none(),
        start_seconds,
        end_seconds,
        start_date,
        end_date,
        days,
        is_cancelled: false,
        is_closed: false,
    }))
}

fn meeting_date(
    value: Option<&str>,
    fallback: Option<NaiveDate>,
) -> Option<Result<NaiveDate, ConvertError>> {
    match non_empty(value) {
        Some(value) => Some(parse_api_timestamp(&value).map(|ts| ts.date()).map_err(Into::into)),
        None => fallback.map(Ok),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectCounts {
    pub courses: usize,
    pub sections: usize,
    pub meetings: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertedCatalog {
    pub courses: Vec<Course>,
    pub prereqs: Vec<Prerequisite>,
    pub antireqs: Vec<Antirequisite>,
    pub profs: Vec<Prof>,
    pub sections: Vec<Section>,
    pub meetings: Vec<Meeting>,
    pub rejected: RejectCounts,
    /// Sections with at least one meeting that failed to convert; their stored meetings are
    /// left as they are.
    pub partial_sections: HashSet<(i32, TermId)>,
}

impl ConvertedCatalog {
    pub fn complete_sections(&self) -> Vec<Section> {
        self.sections
            .iter()
            .filter(|s| !self.partial_sections.contains(&(s.class_number, s.term_id)))
            .cloned()
            .collect()
    }
}

pub fn convert_catalog(
    fetched: &FetchedCatalog,
    terms: &HashMap<TermId, Term>,
    renames: &SubjectRenames,
) -> ConvertedCatalog {
    let mut out = ConvertedCatalog::default();

    for api in &fetched.courses {
        match convert_course(api, renames) {
            Ok(converted) => {
                out.courses.push(converted.course);
                out.prereqs.extend(converted.prereqs);
                out.antireqs.extend(converted.antireqs);
            }
            Err(err) => {
                warn!(error = %err, "failed to convert course");
                out.rejected.courses += 1;
            }
        }
    }

    for batch in &fetched.classes {
        let handle = &batch.handle;
        let code = renames.course_code(&handle.subject, &handle.number);
        let term = terms.get(&handle.term);
        for api in &batch.classes {
            match convert_class(api, &code, handle.term, term) {
                Ok(converted) => {
                    if converted.failed_meetings > 0 {
                        out.partial_sections
                            .insert((converted.section.class_number, converted.section.term_id));
                    }
                    out.sections.push(converted.section);
                    out.meetings.extend(converted.meetings);
                    out.rejected.meetings += converted.rejected_meetings;
                }
                Err(err @ ConvertError::Placeholder { .. }) => {
                    debug!(error = %err, "skipping placeholder class");
                    out.rejected.sections += 1;
                }
                Err(err) => {
                    warn!(error = %err, "failed to convert section");
                    out.rejected.sections += 1;
                }
            }
        }
    }

    out
}

/// Pairs "classes begin" and "classes end" occurrences into terms, ordered by id.
pub fn convert_terms(events: &[ApiEvent]) -> Result<Vec<Term>, ConvertError> {
    let mut starts = BTreeMap::new();
    let mut ends = BTreeMap::new();

    for event in events {
        let (event_kind, dates) = if event.name.trim().eq_ignore_ascii_case(CLASSES_BEGIN_EVENT) {
            ("start", &mut starts)
        } else if event.name.trim().eq_ignore_ascii_case(CLASSES_END_EVENT) {
            ("end", &mut ends)
        } else {
            continue;
        };
        for occurrence in event.occurrences.iter().flatten() {
            let term_id = TermId::from_name(&occurrence.term_name)?;
            let date = occurrence
                .start_date
                .as_deref()
                .filter(|d| !d.trim().is_empty())
                .ok_or_else(|| ConvertError::MissingField {
                    record: format!("{event_kind} event for {}", occurrence.term_name),
                    field: "date",
                })?;
            dates.insert(term_id, parse_api_timestamp(date)?.date());
        }
    }

    let mut terms = Vec::with_capacity(starts.len());
    for (id, start_date) in starts {
        let end_date = ends.remove(&id).ok_or_else(|| ConvertError::UnmatchedTerm {
            event: "start",
            term: id.to_string(),
        })?;
        terms.push(Term {
            id,
            start_date,
            end_date,
        });
    }
    if let Some(id) = ends.keys().next() {
        return Err(ConvertError::UnmatchedTerm {
            event: "end",
            term: id.to_string(),
        });
    }
    Ok(terms)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertedExams {
    pub exams: Vec<Exam>,
    pub rejected: usize,
}

pub fn convert_exams(api: &[ApiExam], term_id: TermId, renames: &SubjectRenames) -> ConvertedExams {
    let mut out = ConvertedExams::default();
    for exam in api {
        match convert_exam(exam, term_id, renames) {
            Ok(converted) => {
                out.exams.extend(converted.exams);
                out.rejected += converted.rejected;
            }
            Err(err) => {
                warn!(error = %err, course = %exam.course, "failed to convert exam");
                out.rejected += exam.sections.len().max(1);
            }
        }
    }
    out
}

/// Expands each exam row's section notation (`"001-002"`, `"001,003"`) into one exam per
/// section. Rows without a usable date become TBA exams without time or location.
pub fn convert_exam(
    api: &ApiExam,
    term_id: TermId,
    renames: &SubjectRenames,
) -> Result<ConvertedExams, ConvertError> {
    let mut parts = api.course.split_whitespace();
    let (Some(subject), Some(number), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ConvertError::InvalidCode(api.course.clone()));
    };
    let code = renames.course_code(subject, number);

    let mut out = ConvertedExams::default();
    for row in &api.sections {
        let numbers = expand_number_range(&row.section);
        if numbers.is_empty() {
            debug!(course = %api.course, section = %row.section, "exam row names no section");
            out.rejected += 1;
            continue;
        }
        let component = row
            .section
            .split(|c: char| !c.is_ascii_alphabetic())
            .find(|word| !word.is_empty())
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| DEFAULT_EXAM_COMPONENT.to_string());

        let schedule = match exam_schedule(row) {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!(error = %err, course = %api.course, "failed to convert exam row");
                out.rejected += 1;
                continue;
            }
        };

        for section_number in numbers {
            out.exams.push(Exam {
                course_code: code.clone(),
                section_name: format!("{component} {section_number:03}"),
                term_id,
                location: schedule.location.clone(),
                start_seconds: schedule.start_seconds,
                end_seconds: schedule.end_seconds,
                date: schedule.date,
                day: schedule.date.map(|d| weekday_code(d).to_string()),
                is_tba: schedule.date.is_none(),
            });
        }
    }
    Ok(out)
}

struct ExamSchedule {
    date: Option<NaiveDate>,
    start_seconds: Option<i32>,
    end_seconds: Option<i32>,
    location: Option<String>,
}

fn exam_schedule(row: &ApiExamSection) -> Result<ExamSchedule, ConvertError> {
    let date = non_empty(Some(row.date.as_str()))
        .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
        .transpose()
        .map_err(|_| ParseError::Timestamp(row.date.clone()))?
        // The v2 feed fills undated rows with 1969-12-31.
        .filter(|d| d.year() >= 1970);

    if date.is_none() {
        return Ok(ExamSchedule {
            date: None,
            start_seconds: None,
            end_seconds: None,
            location: None,
        });
    }

    Ok(ExamSchedule {
        date,
        start_seconds: non_empty(Some(row.start_time.as_str()))
            .map(|t| seconds_from_12h(&t))
            .transpose()?,
        end_seconds: non_empty(Some(row.end_time.as_str()))
            .map(|t| seconds_from_12h(&t))
            .transpose()?,
        location: non_empty(Some(row.location.as_str())),
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
