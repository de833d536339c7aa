use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{
    AdjustmentApplied, AdjustmentCommit, DeliberationStore, EnrollmentDirectory,
    NotificationClaim, RawGradeWrite, ResultSetCommit,
};
use crate::error::{EngineError, Result};
use crate::models::{
    Components, Course, Deliberation, DeliberationResult, DeliberationStatus, EnrolledCourse,
    Grade, GradeModification, PendingNotification, RecipientRole, ResultAmendment, RosterEntry,
    Student, StudentHistoryEntry,
};
use crate::policy::Weights;
use crate::score;

const DELIBERATION_COLUMNS: &str = "id, cohort_id, term, semester, session_type, status, \
     pass_mark, starts_on, ends_on, president_id, secretary_id, version";

const GRADE_COLUMNS: &str = "id, student_id, course_id, term, continuous, practical, exam, \
     final_score, letter, validated, validated_by, version, created_at, updated_at";

const RESULT_COLUMNS: &str = "deliberation_id, student_id, average, credits_obtained, \
     credits_required, decision, rank, mention, remarks";

const MODIFICATION_COLUMNS: &str = "id, grade_id, old_continuous, old_practical, old_exam, \
     new_continuous, new_practical, new_exam, old_final_score, new_final_score, justification, \
     modification_type, modified_by, deliberation_id, grader_notified, president_notified, \
     approved_by, approval_notes, created_at";

const NOTIFICATION_COLUMNS: &str = "id, modification_id, recipient_id, recipient_role, title, \
     message, severity, link, attempts, last_error, delivered_at";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub written: usize,
    pub unchanged: usize,
    pub skipped_validated: usize,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Loads a small cohort with one draft deliberation.
    pub async fn seed(&self, weights: &Weights) -> Result<Uuid> {
        let cohort_id = parse_uuid("6f1c8a52-0d4e-4c57-9a0e-1f2b3c4d5e60")?;
        let teacher_id = parse_uuid("a4e2b1c9-5d3f-4e8a-b7c6-9d0e1f2a3b4c")?;
        let president_id = parse_uuid("c1d2e3f4-a5b6-4c7d-8e9f-0a1b2c3d4e5f")?;
        let deliberation_id = parse_uuid("9b8a7c6d-5e4f-4a3b-9c2d-1e0f9a8b7c6d")?;
        let term = "2025-2026";

        let students = vec![
            (
                parse_uuid("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
                "Avery Lee",
                "avery.lee@example.edu",
                false,
            ),
            (
                parse_uuid("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
                "Jules Moreno",
                "jules.moreno@example.edu",
                false,
            ),
            (
                parse_uuid("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
                "Kiara Patel",
                "kiara.patel@example.edu",
                true,
            ),
        ];

        for (id, name, email, blocked) in &students {
            sqlx::query(
                r#"
                INSERT INTO deliberation.students (id, full_name, email, cohort_id, payment_blocked)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (email) DO UPDATE
                SET full_name = EXCLUDED.full_name, payment_blocked = EXCLUDED.payment_blocked
                "#,
            )
            .bind(id)
            .bind(name)
            .bind(email)
            .bind(cohort_id)
            .bind(blocked)
            .execute(&self.pool)
            .await?;
        }

        let courses = vec![
            (
                parse_uuid("11111111-2222-4333-8444-555555555501")?,
                "ALG101",
                "Linear Algebra",
                6,
                "S1",
            ),
            (
                parse_uuid("11111111-2222-4333-8444-555555555502")?,
                "PRG101",
                "Programming Fundamentals",
                6,
                "S1",
            ),
            (
                parse_uuid("11111111-2222-4333-8444-555555555503")?,
                "NET201",
                "Computer Networks",
                4,
                "S2",
            ),
        ];

        for (id, code, title, credits, semester) in &courses {
            sqlx::query(
                r#"
                INSERT INTO deliberation.courses (id, code, title, credits, semester, cohort_id, teacher_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (code) DO UPDATE
                SET title = EXCLUDED.title, credits = EXCLUDED.credits
                "#,
            )
            .bind(id)
            .bind(code)
            .bind(title)
            .bind(credits)
            .bind(semester)
            .bind(cohort_id)
            .bind(teacher_id)
            .execute(&self.pool)
            .await?;
        }

        let marks = [
            [Some(14.0), Some(15.0), Some(16.0)],
            [Some(9.0), None, Some(8.5)],
            [Some(17.0), Some(18.0), Some(19.0)],
        ];
        for ((student_id, _, _, _), student_marks) in students.iter().zip(marks) {
            for ((course_id, _, _, _, _), mark) in courses.iter().zip(student_marks) {
                sqlx::query(
                    "INSERT INTO deliberation.enrollments (student_id, course_id) \
                     VALUES ($1, $2) ON CONFLICT DO NOTHING",
                )
                .bind(student_id)
                .bind(course_id)
                .execute(&self.pool)
                .await?;

                let components = Components::new(mark, mark, mark.map(|m| (m - 1.0).max(0.0)));
                self.upsert_grade(*student_id, *course_id, term, &components, weights)
                    .await?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO deliberation.deliberations
            (id, cohort_id, term, semester, session_type, status, pass_mark, starts_on, ends_on, president_id)
            VALUES ($1, $2, $3, NULL, 'normal', 'DRAFT', 10, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(deliberation_id)
        .bind(cohort_id)
        .bind(term)
        .bind(seed_date(2026, 6, 20)?)
        .bind(seed_date(2026, 6, 27)?)
        .bind(president_id)
        .execute(&self.pool)
        .await?;

        Ok(deliberation_id)
    }

    /// Raw grade entry. The final score is always derived. A validated grade
    /// is never rewritten here; it changes only through a ledger adjustment.
    async fn upsert_grade(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        term: &str,
        components: &Components,
        weights: &Weights,
    ) -> Result<RawGradeWrite> {
        let outcome = score::evaluate(components, weights)?;
        let result = sqlx::query(
            r#"
            INSERT INTO deliberation.grades AS g
            (id, student_id, course_id, term, continuous, practical, exam, final_score, letter)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (student_id, course_id, term) DO UPDATE
            SET continuous = EXCLUDED.continuous,
                practical = EXCLUDED.practical,
                exam = EXCLUDED.exam,
                final_score = EXCLUDED.final_score,
                letter = EXCLUDED.letter,
                validated = FALSE,
                validated_by = NULL,
                version = g.version + 1,
                updated_at = now()
            WHERE NOT g.validated
              AND (g.continuous, g.practical, g.exam)
                IS DISTINCT FROM (EXCLUDED.continuous, EXCLUDED.practical, EXCLUDED.exam)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(course_id)
        .bind(term)
        .bind(components.continuous)
        .bind(components.practical)
        .bind(components.exam)
        .bind(outcome.final_score)
        .bind(outcome.letter.map(|letter| letter.as_str()))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(RawGradeWrite::Written);
        }

        let blocked = sqlx::query(
            r#"
            SELECT 1 FROM deliberation.grades
            WHERE student_id = $1 AND course_id = $2 AND term = $3
              AND validated
              AND (continuous, practical, exam) IS DISTINCT FROM ($4, $5, $6)
            "#,
        )
        .bind(student_id)
        .bind(course_id)
        .bind(term)
        .bind(components.continuous)
        .bind(components.practical)
        .bind(components.exam)
        .fetch_optional(&self.pool)
        .await?;

        Ok(if blocked.is_some() {
            RawGradeWrite::SkippedValidated
        } else {
            RawGradeWrite::Unchanged
        })
    }

    /// Bulk raw-grade load keyed by student email and course code. Rows that
    /// would change a validated grade are skipped and counted.
    pub async fn import_grades_csv(
        &self,
        csv_path: &Path,
        weights: &Weights,
    ) -> Result<ImportSummary> {
        #[derive(serde::Deserialize)]
        struct CsvRow {
            student_email: String,
            course_code: String,
            term: String,
            continuous: Option<f64>,
            practical: Option<f64>,
            exam: Option<f64>,
        }

        let mut reader = csv::Reader::from_path(csv_path)
            .map_err(|err| EngineError::invalid(format!("cannot read {}: {err}", csv_path.display())))?;
        let mut summary = ImportSummary::default();

        for (line, record) in reader.deserialize::<CsvRow>().enumerate() {
            let row = record
                .map_err(|err| EngineError::invalid(format!("row {}: {err}", line + 1)))?;

            let student_id: Uuid = sqlx::query("SELECT id FROM deliberation.students WHERE email = $1")
                .bind(&row.student_email)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    EngineError::invalid(format!("row {}: unknown student {}", line + 1, row.student_email))
                })?
                .try_get("id")?;

            let course_id: Uuid = sqlx::query("SELECT id FROM deliberation.courses WHERE code = $1")
                .bind(&row.course_code)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    EngineError::invalid(format!("row {}: unknown course {}", line + 1, row.course_code))
                })?
                .try_get("id")?;

            let components = Components::new(row.continuous, row.practical, row.exam);
            match self
                .upsert_grade(student_id, course_id, &row.term, &components, weights)
                .await?
            {
                RawGradeWrite::Written => summary.written += 1,
                RawGradeWrite::Unchanged => summary.unchanged += 1,
                RawGradeWrite::SkippedValidated => {
                    tracing::warn!(
                        row = line + 1,
                        student = %row.student_email,
                        course = %row.course_code,
                        "validated grade left untouched; use an adjustment"
                    );
                    summary.skipped_validated += 1;
                }
            }
        }

        Ok(summary)
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|err| EngineError::Internal(format!("bad seed id: {err}")))
}

fn seed_date(year: i32, month: u32, day: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| EngineError::Internal("invalid seed date".to_string()))
}

fn student_from_row(row: &PgRow, id_column: &str) -> Result<Student> {
    Ok(Student {
        id: row.try_get(id_column)?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        cohort_id: row.try_get("cohort_id")?,
        standing: row.try_get::<String, _>("standing")?.parse()?,
        payment_blocked: row.try_get("payment_blocked")?,
    })
}

fn deliberation_from_row(row: &PgRow) -> Result<Deliberation> {
    Ok(Deliberation {
        id: row.try_get("id")?,
        cohort_id: row.try_get("cohort_id")?,
        term: row.try_get("term")?,
        semester: row.try_get("semester")?,
        session_type: row.try_get::<String, _>("session_type")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        pass_mark: row.try_get("pass_mark")?,
        starts_on: row.try_get("starts_on")?,
        ends_on: row.try_get("ends_on")?,
        president_id: row.try_get("president_id")?,
        secretary_id: row.try_get("secretary_id")?,
        version: row.try_get("version")?,
    })
}

fn grade_from_row(row: &PgRow, id_column: &str) -> Result<Grade> {
    Ok(Grade {
        id: row.try_get(id_column)?,
        student_id: row.try_get("student_id")?,
        course_id: row.try_get("course_id")?,
        term: row.try_get("term")?,
        components: Components::new(
            row.try_get("continuous")?,
            row.try_get("practical")?,
            row.try_get("exam")?,
        ),
        final_score: row.try_get("final_score")?,
        letter: row
            .try_get::<Option<String>, _>("letter")?
            .map(|letter| letter.parse())
            .transpose()?,
        validated: row.try_get("validated")?,
        validated_by: row.try_get("validated_by")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn result_from_row(row: &PgRow) -> Result<DeliberationResult> {
    Ok(DeliberationResult {
        deliberation_id: row.try_get("deliberation_id")?,
        student_id: row.try_get("student_id")?,
        average: row.try_get("average")?,
        credits_obtained: row.try_get("credits_obtained")?,
        credits_required: row.try_get("credits_required")?,
        decision: row.try_get::<String, _>("decision")?.parse()?,
        rank: row.try_get("rank")?,
        mention: row
            .try_get::<Option<String>, _>("mention")?
            .map(|mention| mention.parse())
            .transpose()?,
        remarks: row.try_get("remarks")?,
    })
}

fn modification_from_row(row: &PgRow) -> Result<GradeModification> {
    Ok(GradeModification {
        id: row.try_get("id")?,
        grade_id: row.try_get("grade_id")?,
        old_components: Components::new(
            row.try_get("old_continuous")?,
            row.try_get("old_practical")?,
            row.try_get("old_exam")?,
        ),
        new_components: Components::new(
            row.try_get("new_continuous")?,
            row.try_get("new_practical")?,
            row.try_get("new_exam")?,
        ),
        old_final_score: row.try_get("old_final_score")?,
        new_final_score: row.try_get("new_final_score")?,
        justification: row.try_get("justification")?,
        modification_type: row.try_get::<String, _>("modification_type")?.parse()?,
        modified_by: row.try_get("modified_by")?,
        deliberation_id: row.try_get("deliberation_id")?,
        grader_notified: row.try_get("grader_notified")?,
        president_notified: row.try_get("president_notified")?,
        approved_by: row.try_get("approved_by")?,
        approval_notes: row.try_get("approval_notes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<PendingNotification> {
    Ok(PendingNotification {
        id: row.try_get("id")?,
        modification_id: row.try_get("modification_id")?,
        recipient_id: row.try_get("recipient_id")?,
        recipient_role: row.try_get::<String, _>("recipient_role")?.parse()?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        severity: row.try_get::<String, _>("severity")?.parse()?,
        link: row.try_get("link")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

#[async_trait]
impl DeliberationStore for PgStore {
    async fn deliberation(&self, id: Uuid) -> Result<Option<Deliberation>> {
        let query = format!("SELECT {DELIBERATION_COLUMNS} FROM deliberation.deliberations WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deliberation_from_row).transpose()
    }

    async fn grade(&self, id: Uuid) -> Result<Option<Grade>> {
        let query = format!("SELECT {GRADE_COLUMNS} FROM deliberation.grades WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|row| grade_from_row(row, "id")).transpose()
    }

    async fn results(&self, deliberation_id: Uuid) -> Result<Vec<DeliberationResult>> {
        let query = format!(
            "SELECT {RESULT_COLUMNS} FROM deliberation.deliberation_results \
             WHERE deliberation_id = $1 ORDER BY rank ASC NULLS LAST, student_id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(deliberation_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn student_results(&self, student_id: Uuid) -> Result<Vec<StudentHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT r.deliberation_id, r.student_id, r.average, r.credits_obtained,
                   r.credits_required, r.decision, r.rank, r.mention, r.remarks,
                   d.cohort_id, d.term, d.semester, d.session_type, d.starts_on
            FROM deliberation.deliberation_results r
            JOIN deliberation.deliberations d ON d.id = r.deliberation_id
            WHERE r.student_id = $1
            ORDER BY d.starts_on DESC, d.id ASC
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StudentHistoryEntry {
                    deliberation_id: row.try_get("deliberation_id")?,
                    cohort_id: row.try_get("cohort_id")?,
                    term: row.try_get("term")?,
                    semester: row.try_get("semester")?,
                    session_type: row.try_get::<String, _>("session_type")?.parse()?,
                    starts_on: row.try_get("starts_on")?,
                    result: result_from_row(row)?,
                })
            })
            .collect()
    }

    async fn modifications(&self, grade_id: Uuid) -> Result<Vec<GradeModification>> {
        let query = format!(
            "SELECT {MODIFICATION_COLUMNS} FROM deliberation.grade_modifications \
             WHERE grade_id = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(grade_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(modification_from_row).collect()
    }

    async fn replace_results(&self, commit: &ResultSetCommit) -> Result<Deliberation> {
        let mut tx = self.pool.begin().await?;

        let version: i64 = sqlx::query(
            "SELECT version FROM deliberation.deliberations WHERE id = $1 FOR UPDATE",
        )
        .bind(commit.deliberation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::not_found("deliberation", commit.deliberation_id))?
        .try_get("version")?;

        if version != commit.expected_version {
            return Err(EngineError::conflict(format!(
                "deliberation {} moved from version {} to {version} during compilation",
                commit.deliberation_id, commit.expected_version
            )));
        }

        sqlx::query("DELETE FROM deliberation.deliberation_results WHERE deliberation_id = $1")
            .bind(commit.deliberation_id)
            .execute(&mut *tx)
            .await?;

        for result in &commit.results {
            sqlx::query(
                r#"
                INSERT INTO deliberation.deliberation_results
                (deliberation_id, student_id, average, credits_obtained, credits_required,
                 decision, rank, mention, remarks)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(result.deliberation_id)
            .bind(result.student_id)
            .bind(result.average)
            .bind(result.credits_obtained)
            .bind(result.credits_required)
            .bind(result.decision.as_str())
            .bind(result.rank)
            .bind(result.mention.map(|mention| mention.as_str()))
            .bind(&result.remarks)
            .execute(&mut *tx)
            .await?;
        }

        let query = format!(
            "UPDATE deliberation.deliberations SET status = $2, version = version + 1 \
             WHERE id = $1 RETURNING {DELIBERATION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(commit.deliberation_id)
            .bind(commit.status.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let deliberation = deliberation_from_row(&row)?;

        tx.commit().await?;
        Ok(deliberation)
    }

    async fn apply_adjustment(&self, commit: &AdjustmentCommit) -> Result<AdjustmentApplied> {
        let mut tx = self.pool.begin().await?;

        let version: i64 =
            sqlx::query("SELECT version FROM deliberation.grades WHERE id = $1 FOR UPDATE")
                .bind(commit.grade_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| EngineError::not_found("grade", commit.grade_id))?
                .try_get("version")?;

        if version != commit.expected_grade_version {
            return Err(EngineError::conflict(format!(
                "grade {} changed while the adjustment was prepared",
                commit.grade_id
            )));
        }

        let modification = &commit.modification;
        sqlx::query(
            r#"
            INSERT INTO deliberation.grade_modifications
            (id, grade_id, old_continuous, old_practical, old_exam,
             new_continuous, new_practical, new_exam, old_final_score, new_final_score,
             justification, modification_type, modified_by, deliberation_id,
             grader_notified, president_notified, approved_by, approval_notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    FALSE, FALSE, $15, $16, $17)
            "#,
        )
        .bind(modification.id)
        .bind(modification.grade_id)
        .bind(modification.old_components.continuous)
        .bind(modification.old_components.practical)
        .bind(modification.old_components.exam)
        .bind(modification.new_components.continuous)
        .bind(modification.new_components.practical)
        .bind(modification.new_components.exam)
        .bind(modification.old_final_score)
        .bind(modification.new_final_score)
        .bind(&modification.justification)
        .bind(modification.modification_type.as_str())
        .bind(modification.modified_by)
        .bind(modification.deliberation_id)
        .bind(modification.approved_by)
        .bind(&modification.approval_notes)
        .bind(modification.created_at)
        .execute(&mut *tx)
        .await?;

        for notification in &commit.notifications {
            sqlx::query(
                r#"
                INSERT INTO deliberation.pending_notifications
                (id, modification_id, recipient_id, recipient_role, title, message, severity, link)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(notification.id)
            .bind(notification.modification_id)
            .bind(notification.recipient_id)
            .bind(notification.recipient_role.as_str())
            .bind(&notification.title)
            .bind(&notification.message)
            .bind(notification.severity.as_str())
            .bind(&notification.link)
            .execute(&mut *tx)
            .await?;
        }

        let query = format!(
            r#"
            UPDATE deliberation.grades
            SET continuous = $2, practical = $3, exam = $4, final_score = $5, letter = $6,
                validated = FALSE, validated_by = NULL, version = version + 1, updated_at = now()
            WHERE id = $1
            RETURNING {GRADE_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(commit.grade_id)
            .bind(commit.components.continuous)
            .bind(commit.components.practical)
            .bind(commit.components.exam)
            .bind(commit.final_score)
            .bind(commit.letter.map(|letter| letter.as_str()))
            .fetch_one(&mut *tx)
            .await?;
        let grade = grade_from_row(&row, "id")?;

        let deliberation = match commit.deliberation_id {
            Some(id) => {
                let query = format!(
                    r#"
                    UPDATE deliberation.deliberations
                    SET status = CASE WHEN status IN ('COMPILED', 'IN_SESSION')
                                      THEN 'ADJUSTED' ELSE status END,
                        version = version + 1
                    WHERE id = $1
                    RETURNING {DELIBERATION_COLUMNS}
                    "#
                );
                let row = sqlx::query(&query)
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| EngineError::not_found("deliberation", id))?;
                Some(deliberation_from_row(&row)?)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(AdjustmentApplied {
            grade,
            deliberation,
        })
    }

    async fn amend_result(
        &self,
        deliberation_id: Uuid,
        student_id: Uuid,
        amendment: &ResultAmendment,
    ) -> Result<DeliberationResult> {
        let query = format!(
            r#"
            UPDATE deliberation.deliberation_results
            SET decision = COALESCE($3, decision),
                mention = CASE WHEN $4 THEN $5 ELSE mention END,
                remarks = COALESCE($6, remarks)
            WHERE deliberation_id = $1 AND student_id = $2
            RETURNING {RESULT_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(deliberation_id)
            .bind(student_id)
            .bind(amendment.decision.map(|decision| decision.as_str()))
            .bind(amendment.mention.is_some())
            .bind(amendment.mention.flatten().map(|mention| mention.as_str()))
            .bind(&amendment.remarks)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::not_found("deliberation result", student_id))?;
        result_from_row(&row)
    }

    async fn set_status(
        &self,
        deliberation_id: Uuid,
        status: DeliberationStatus,
    ) -> Result<Deliberation> {
        let query = format!(
            "UPDATE deliberation.deliberations SET status = $2, version = version + 1 \
             WHERE id = $1 RETURNING {DELIBERATION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(deliberation_id)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::not_found("deliberation", deliberation_id))?;
        deliberation_from_row(&row)
    }

    async fn claim_notifications(
        &self,
        claim: &NotificationClaim,
    ) -> Result<Vec<PendingNotification>> {
        // SKIP LOCKED keeps two dispatchers from claiming the same row
        let query = format!(
            r#"
            WITH candidates AS (
                SELECT id FROM deliberation.pending_notifications
                WHERE delivered_at IS NULL
                  AND attempts < $3
                  AND ($1::uuid IS NULL OR modification_id = $1)
                  AND (claimed_until IS NULL OR claimed_until <= now())
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ), claimed AS (
                UPDATE deliberation.pending_notifications AS n
                SET claimed_until = now() + make_interval(secs => $4)
                FROM candidates
                WHERE n.id = candidates.id
                RETURNING n.*
            )
            SELECT {NOTIFICATION_COLUMNS} FROM claimed ORDER BY created_at ASC, id ASC
            "#
        );
        let rows = sqlx::query(&query)
            .bind(claim.modification_id)
            .bind(i64::try_from(claim.limit).unwrap_or(i64::MAX))
            .bind(claim.max_attempts)
            .bind(claim.lease.num_milliseconds() as f64 / 1000.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_delivered(&self, notification_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE deliberation.pending_notifications
            SET delivered_at = now(), attempts = attempts + 1, claimed_until = NULL
            WHERE id = $1 AND delivered_at IS NULL
            RETURNING modification_id, recipient_role
            "#,
        )
        .bind(notification_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            let exists = sqlx::query("SELECT 1 FROM deliberation.pending_notifications WHERE id = $1")
                .bind(notification_id)
                .fetch_optional(&mut *tx)
                .await?;
            return match exists {
                Some(_) => Ok(()),
                None => Err(EngineError::not_found("notification", notification_id)),
            };
        };

        let modification_id: Uuid = row.try_get("modification_id")?;
        let role: RecipientRole = row.try_get::<String, _>("recipient_role")?.parse()?;
        let flag_update = match role {
            RecipientRole::Grader => {
                "UPDATE deliberation.grade_modifications SET grader_notified = TRUE WHERE id = $1"
            }
            RecipientRole::President => {
                "UPDATE deliberation.grade_modifications SET president_notified = TRUE WHERE id = $1"
            }
        };
        sqlx::query(flag_update)
            .bind(modification_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_delivery_failure(&self, notification_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE deliberation.pending_notifications \
             SET attempts = attempts + 1, last_error = $2, claimed_until = NULL WHERE id = $1",
        )
        .bind(notification_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EnrollmentDirectory for PgStore {
    async fn roster(
        &self,
        cohort_id: Uuid,
        term: &str,
        semester: Option<&str>,
    ) -> Result<Vec<RosterEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id AS student_id, s.full_name, s.email, s.cohort_id, s.standing,
                   s.payment_blocked,
                   c.id AS course_id, c.code, c.title, c.credits, c.semester,
                   c.cohort_id AS course_cohort_id, c.teacher_id,
                   g.id AS grade_id, g.term, g.continuous, g.practical, g.exam,
                   g.final_score, g.letter, g.validated, g.validated_by, g.version,
                   g.created_at, g.updated_at
            FROM deliberation.students s
            LEFT JOIN deliberation.enrollments e ON e.student_id = s.id
            LEFT JOIN deliberation.courses c
                ON c.id = e.course_id AND ($3::text IS NULL OR c.semester = $3)
            LEFT JOIN deliberation.grades g
                ON g.student_id = s.id AND g.course_id = c.id AND g.term = $2
            WHERE s.cohort_id = $1 AND s.standing = 'active'
            ORDER BY s.id, c.code
            "#,
        )
        .bind(cohort_id)
        .bind(term)
        .bind(semester)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<RosterEntry> = Vec::new();
        let mut positions: HashMap<Uuid, usize> = HashMap::new();

        for row in &rows {
            let student_id: Uuid = row.try_get("student_id")?;
            let position = match positions.get(&student_id) {
                Some(position) => *position,
                None => {
                    entries.push(RosterEntry {
                        student: student_from_row(row, "student_id")?,
                        courses: Vec::new(),
                    });
                    positions.insert(student_id, entries.len() - 1);
                    entries.len() - 1
                }
            };

            let Some(course_id) = row.try_get::<Option<Uuid>, _>("course_id")? else {
                continue;
            };
            let grade = match row.try_get::<Option<Uuid>, _>("grade_id")? {
                Some(_) => Some(grade_from_row(row, "grade_id")?),
                None => None,
            };
            entries[position].courses.push(EnrolledCourse {
                course: Course {
                    id: course_id,
                    code: row.try_get("code")?,
                    title: row.try_get("title")?,
                    credits: row.try_get("credits")?,
                    semester: row.try_get("semester")?,
                    cohort_id: row.try_get("course_cohort_id")?,
                    teacher_id: row.try_get("teacher_id")?,
                },
                grade,
            });
        }

        Ok(entries)
    }

    async fn student(&self, student_id: Uuid) -> Result<Option<Student>> {
        let row = sqlx::query(
            "SELECT id, full_name, email, cohort_id, standing, payment_blocked \
             FROM deliberation.students WHERE id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(|row| student_from_row(row, "id")).transpose()
    }

    async fn course(&self, course_id: Uuid) -> Result<Option<Course>> {
        let row = sqlx::query(
            "SELECT id, code, title, credits, semester, cohort_id, teacher_id \
             FROM deliberation.courses WHERE id = $1",
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Course {
                id: row.try_get("id")?,
                code: row.try_get("code")?,
                title: row.try_get("title")?,
                credits: row.try_get("credits")?,
                semester: row.try_get("semester")?,
                cohort_id: row.try_get("cohort_id")?,
                teacher_id: row.try_get("teacher_id")?,
            })
        })
        .transpose()
    }
}
