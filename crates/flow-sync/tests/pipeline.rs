mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::TestDb;
use flow_adapters::{
    ApiClass, ApiClassSchedule, ApiCourse, ApiEvent, ApiEventOccurrence, ApiExam, ApiExamSection,
    CatalogSource,
};
use flow_core::{ImportOutcome, TermId};
use flow_fetch::FetchError;
use flow_sync::{SyncConfig, SyncPipeline, Task};
use pretty_assertions::assert_eq;

/// Serves the same two courses in every term; only CS 136 is offered.
struct StaticCatalog {
    balanced_terms: bool,
    meeting_start: &'static str,
}

impl StaticCatalog {
    fn new() -> Self {
        Self {
            balanced_terms: true,
            meeting_start: "2030-09-01T10:00:00",
        }
    }
}

fn occurrence(term: TermId, date: &str) -> ApiEventOccurrence {
    ApiEventOccurrence {
        term_name: format!("{} {}", term.season(), term.year()),
        start_date: Some(format!("{date}T00:00:00")),
        end_date: None,
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn important_dates(&self) -> Result<Vec<ApiEvent>, FetchError> {
        let current = TermId::current();
        let mut ends = vec![occurrence(current, "2030-12-01")];
        if !self.balanced_terms {
            ends.clear();
        }
        Ok(vec![
            ApiEvent {
                name: "Classes begin".to_string(),
                occurrences: Some(vec![occurrence(current, "2030-09-01")]),
            },
            ApiEvent {
                name: "Classes end".to_string(),
                occurrences: Some(ends),
            },
        ])
    }

    async fn courses(&self, _term: TermId) -> Result<Vec<ApiCourse>, FetchError> {
        Ok(vec![
            ApiCourse {
                subject_code: "CS".to_string(),
                catalog_number: "135".to_string(),
                title: "Designing Functional Programs".to_string(),
                description: None,
                requirements_description: Some("Antireq: CS 115".to_string()),
            },
            ApiCourse {
                subject_code: "CS".to_string(),
                catalog_number: "136".to_string(),
                title: "Elementary Algorithm Design and Data Abstraction".to_string(),
                description: Some("This course builds on the techniques of CS 135.".to_string()),
                requirements_description: Some("Prereq: CS 135".to_string()),
            },
        ])
    }

    async fn class_schedules(
        &self,
        term: TermId,
        _subject: &str,
        number: &str,
    ) -> Result<Vec<ApiClass>, FetchError> {
        if number != "136" {
            return Ok(Vec::new());
        }
        Ok(vec![ApiClass {
            class_number: 5000 + term.get() % 100,
            course_component: Some("LEC".to_string()),
            class_section: 1,
            max_enrollment_capacity: 120,
            enrolled_students: 100,
            term_code: Some(term.to_string()),
            schedule_data: Some(vec![ApiClassSchedule {
                schedule_start_date: Some("2030-09-01T00:00:00".to_string()),
                schedule_end_date: Some("2030-12-01T00:00:00".to_string()),
                class_meeting_start_time: Some(self.meeting_start.to_string()),
                class_meeting_end_time: Some("2030-09-01T11:20:00".to_string()),
                location_name: Some("MC 2065".to_string()),
                class_meeting_week_pattern_code: Some("NYNYNNN".to_string()),
                class_meeting_number: 1,
            }]),
        }])
    }

    async fn exam_schedule(&self, _term: TermId) -> Result<Vec<ApiExam>, FetchError> {
        Ok(vec![ApiExam {
            course: "CS 136".to_string(),
            sections: vec![ApiExamSection {
                section: "001".to_string(),
                date: "2030-12-10".to_string(),
                start_time: "9:00 AM".to_string(),
                end_time: "11:30 AM".to_string(),
                location: "PAC 1".to_string(),
            }],
        }])
    }
}

fn pipeline(db: &TestDb, catalog: StaticCatalog) -> SyncPipeline {
    let config = SyncConfig::from_lookup(|key| match key {
        "FLOW_FETCH_CONCURRENCY" => Some("2".to_string()),
        _ => None,
    });
    SyncPipeline::new(
        config,
        db.store.clone(),
        Arc::new(catalog),
    )
}

#[tokio::test]
async fn hourly_run_is_idempotent() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let pipeline = pipeline(&db, StaticCatalog::new());

    let first = pipeline.run(Task::Hourly).await;
    assert!(first.is_success(), "{:?}", first.failures);
    assert_eq!(first.outcome("term").map(|o| o.inserted), Some(1));
    assert_eq!(first.outcome("course").map(|o| o.inserted), Some(2));
    // CS 115 is not in the catalog.
    assert_eq!(first.outcome("course_antirequisite").map(|o| o.rejected), Some(1));
    assert_eq!(first.outcome("course_prerequisite").map(|o| o.inserted), Some(1));
    assert_eq!(first.outcome("course_section").map(|o| o.inserted), Some(4));
    assert_eq!(first.outcome("section_meeting").map(|o| o.inserted), Some(4));

    let second = pipeline.run(Task::Hourly).await;
    assert!(second.is_success(), "{:?}", second.failures);
    for report in &second.imports {
        assert_eq!(report.outcome.inserted, 0, "{}", report.kind);
        assert_eq!(report.outcome.updated, 0, "{}", report.kind);
    }
    assert_eq!(second.outcome("course").map(|o| o.untouched), Some(2));
    assert_eq!(second.outcome("section_meeting").map(|o| o.untouched), Some(4));

    db.teardown().await;
}

#[tokio::test]
async fn term_boundary_failure_does_not_block_courses() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let pipeline = pipeline(
        &db,
        StaticCatalog {
            balanced_terms: false,
            ..StaticCatalog::new()
        },
    );

    let summary = pipeline.run(Task::Hourly).await;
    assert!(!summary.is_success());
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].kind, "term");
    assert_eq!(summary.outcome("term"), None);
    assert_eq!(summary.outcome("course").map(|o| o.inserted), Some(2));
    assert_eq!(db.count("SELECT COUNT(*) FROM term").await, 0);

    db.teardown().await;
}

#[tokio::test]
async fn exams_follow_sections_and_vacuum_keeps_current_terms() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let pipeline = pipeline(&db, StaticCatalog::new());
    assert!(pipeline.run(Task::Courses).await.is_success());

    let exams = pipeline.run(Task::Exams).await;
    assert!(exams.is_success(), "{:?}", exams.failures);
    assert_eq!(exams.outcome("section_exam").map(|o| o.inserted), Some(1));

    let vacuum = pipeline.run(Task::Vacuum).await;
    assert!(vacuum.is_success());
    assert_eq!(vacuum.vacuum.map(|v| v.sections), Some(0));
    assert_eq!(db.count("SELECT COUNT(*) FROM course_section").await, 4);

    db.teardown().await;
}

#[tokio::test]
async fn unconvertible_meetings_keep_stored_rows() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let first = pipeline(&db, StaticCatalog::new()).run(Task::Hourly).await;
    assert!(first.is_success(), "{:?}", first.failures);
    assert_eq!(db.count("SELECT COUNT(*) FROM section_meeting").await, 4);

    let garbled = pipeline(
        &db,
        StaticCatalog {
            meeting_start: "10:00",
            ..StaticCatalog::new()
        },
    );
    let second = garbled.run(Task::Courses).await;
    assert!(second.is_success(), "{:?}", second.failures);
    assert_eq!(
        second.outcome("section_meeting"),
        Some(ImportOutcome {
            inserted: 0,
            updated: 0,
            untouched: 0,
            rejected: 4,
        })
    );
    assert_eq!(db.count("SELECT COUNT(*) FROM section_meeting").await, 4);

    db.teardown().await;
}
