//! Shared cohort fixture for engine tests.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    Components, Course, Deliberation, DeliberationStatus, Grade, SessionType, Standing, Student,
};
use crate::policy::Weights;
use crate::score;
use crate::store::{MemoryStore, RawGradeWrite};

pub const TERM: &str = "2025-2026";

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub cohort_id: Uuid,
    pub deliberation_id: Uuid,
    pub officer: Uuid,
    pub teacher: Uuid,
    pub president: Uuid,
    pub strong_student: Uuid,
    pub weak_student: Uuid,
    pub blocked_student: Uuid,
    pub strong_grade: Uuid,
    pub weak_grade: Uuid,
}

fn student(id: Uuid, name: &str, cohort_id: Uuid, payment_blocked: bool) -> Student {
    Student {
        id,
        full_name: name.to_string(),
        email: format!("{}@example.edu", name.to_lowercase().replace(' ', ".")),
        cohort_id,
        standing: Standing::Active,
        payment_blocked,
    }
}

pub fn grade(id: Uuid, student_id: Uuid, course_id: Uuid, components: Components) -> Grade {
    let outcome = score::evaluate(&components, &Weights::default()).expect("fixture scores in range");
    let now = Utc::now();
    Grade {
        id,
        student_id,
        course_id,
        term: TERM.to_string(),
        components,
        final_score: outcome.final_score,
        letter: outcome.letter,
        validated: true,
        validated_by: Some(Uuid::from_u128(0xA1)),
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

fn flat(score: f64) -> Components {
    Components::new(Some(score), Some(score), Some(score))
}

impl Fixture {
    pub async fn build() -> Self {
        Self::build_on(Arc::new(MemoryStore::new())).await
    }

    /// Three active students over two courses (6 + 4 credits), a dropped
    /// student who must never appear, and one draft deliberation. Only the
    /// weak student's grades are unvalidated.
    pub async fn build_on(store: Arc<MemoryStore>) -> Self {
        let cohort_id = Uuid::from_u128(0xC0);
        let officer = Uuid::from_u128(0xA1);
        let teacher = Uuid::from_u128(0xA2);
        let president = Uuid::from_u128(0xA3);
        let algebra = Uuid::from_u128(0xB1);
        let networks = Uuid::from_u128(0xB2);
        let strong_student = Uuid::from_u128(0x10);
        let weak_student = Uuid::from_u128(0x20);
        let blocked_student = Uuid::from_u128(0x30);
        let dropped_student = Uuid::from_u128(0x40);
        let deliberation_id = Uuid::from_u128(0xD1);

        for (id, code, credits) in [(algebra, "ALG101", 6), (networks, "NET101", 4)] {
            store
                .insert_course(Course {
                    id,
                    code: code.to_string(),
                    title: code.to_string(),
                    credits,
                    semester: "S1".to_string(),
                    cohort_id,
                    teacher_id: Some(teacher),
                })
                .await;
        }

        store.insert_student(student(strong_student, "Avery Lee", cohort_id, false)).await;
        store.insert_student(student(weak_student, "Jules Moreno", cohort_id, false)).await;
        store.insert_student(student(blocked_student, "Kiara Patel", cohort_id, true)).await;
        let mut dropped = student(dropped_student, "Noor Haddad", cohort_id, false);
        dropped.standing = Standing::Dropped;
        store.insert_student(dropped).await;

        let strong_grade = Uuid::from_u128(0x1001);
        let weak_grade = Uuid::from_u128(0x2001);
        let grades = [
            (strong_grade, strong_student, algebra, flat(13.0)),
            (Uuid::from_u128(0x1002), strong_student, networks, flat(14.0)),
            (weak_grade, weak_student, algebra, flat(6.0)),
            (
                Uuid::from_u128(0x2002),
                weak_student,
                networks,
                Components::new(None, None, Some(5.0)),
            ),
            (Uuid::from_u128(0x3001), blocked_student, algebra, flat(18.0)),
            (Uuid::from_u128(0x3002), blocked_student, networks, flat(19.0)),
            (Uuid::from_u128(0x4001), dropped_student, algebra, flat(20.0)),
        ];
        for (id, student_id, course_id, components) in grades {
            store.enroll(student_id, course_id).await;
            let mut entry = grade(id, student_id, course_id, components);
            // the weak student's grades are still awaiting validation
            if student_id == weak_student {
                entry.validated = false;
                entry.validated_by = None;
            }
            store.insert_grade(entry).await;
        }

        store
            .insert_deliberation(Deliberation {
                id: deliberation_id,
                cohort_id,
                term: TERM.to_string(),
                semester: None,
                session_type: SessionType::Normal,
                status: DeliberationStatus::Draft,
                pass_mark: 10.0,
                starts_on: NaiveDate::from_ymd_opt(2026, 6, 20).expect("valid date"),
                ends_on: NaiveDate::from_ymd_opt(2026, 6, 27).expect("valid date"),
                president_id: Some(president),
                secretary_id: None,
                version: 0,
            })
            .await;

        Self {
            store,
            cohort_id,
            deliberation_id,
            officer,
            teacher,
            president,
            strong_student,
            weak_student,
            blocked_student,
            strong_grade,
            weak_grade,
        }
    }

    /// Raw grade entry outside the ledger, as the bulk-entry flow would do.
    pub async fn set_exam(&self, grade_id: Uuid, exam: Option<f64>) {
        let outcome = self
            .store
            .record_raw_components(grade_id, &Components::new(None, None, exam), &Weights::default())
            .await
            .expect("grade exists");
        assert_eq!(outcome, RawGradeWrite::Written, "raw entry on {grade_id}");
    }
}
