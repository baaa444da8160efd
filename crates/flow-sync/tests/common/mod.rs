#![allow(dead_code)]

use std::time::Duration;

use chrono::NaiveDate;
use flow_core::{Course, ImportOutcome, Meeting, Section, TermId};
use flow_sync::CatalogStore;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../fixtures/schema.sql");

/// A throwaway schema in the database named by `FLOW_TEST_DATABASE_URL`.
pub struct TestDb {
    pub store: CatalogStore,
    admin: PgPool,
    schema: String,
}

impl TestDb {
    pub async fn create() -> Option<Self> {
        let Ok(url) = std::env::var("FLOW_TEST_DATABASE_URL") else {
            eprintln!("FLOW_TEST_DATABASE_URL not set; skipping database test");
            return None;
        };

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .expect("connect admin pool");
        let schema = format!("flow_test_{}", Uuid::new_v4().simple());
        admin
            .execute(format!("CREATE SCHEMA {schema}").as_str())
            .await
            .expect("create schema");

        let search_path = format!("SET search_path TO {schema}");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .after_connect(move |conn, _meta| {
                let sql = search_path.clone();
                Box::pin(async move {
                    conn.execute(sql.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .expect("connect test pool");
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .expect("apply schema");

        Some(Self {
            store: CatalogStore::new(pool, Duration::from_secs(30)),
            admin,
            schema,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql)
            .fetch_one(self.pool())
            .await
            .expect("count query")
    }

    pub async fn teardown(self) {
        self.store.pool().close().await;
        self.admin
            .execute(format!("DROP SCHEMA {} CASCADE", self.schema).as_str())
            .await
            .expect("drop schema");
    }
}

pub fn term(id: i32) -> TermId {
    TermId::try_from(id).expect("valid term id")
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub fn course(code: &str, name: &str) -> Course {
    Course {
        code: code.to_string(),
        name: name.to_string(),
        description: None,
        prereqs: None,
        coreqs: None,
        antireqs: None,
    }
}

pub fn section(course_code: &str, class_number: i32, name: &str, term_id: TermId) -> Section {
    Section {
        course_code: course_code.to_string(),
        class_number,
        section_name: name.to_string(),
        campus: String::new(),
        enrollment_capacity: 90,
        enrollment_total: 10,
        term_id,
    }
}

pub fn meeting(class_number: i32, term_id: TermId, location: &str, start_seconds: i32) -> Meeting {
    Meeting {
        class_number,
        term_id,
        prof_code: None,
        location: Some(location.to_string()),
        start_seconds: Some(start_seconds),
        end_seconds: Some(start_seconds + 4800),
        start_date: date(2021, 9, 8),
        end_date: date(2021, 12, 7),
        days: vec!["T".to_string(), "Th".to_string()],
        is_cancelled: false,
        is_closed: false,
        is_tba: false,
    }
}

pub fn outcome(inserted: usize, updated: usize, untouched: usize, rejected: usize) -> ImportOutcome {
    ImportOutcome {
        inserted,
        updated,
        untouched,
        rejected,
    }
}
