use crate::error::{ServiceError, ServiceResult};
use crate::identity::IdentityResolver;
use crate::models::{AnswerMap, Exam, NewSubmission, Submission, SubmissionStatus, ValidationIssue};
use crate::rooms::{bump_room_counter, RoomCounter};
use crate::scoring::grade;
use crate::store::{
    from_document, resolve_server_timestamps, server_timestamp, set_field, to_document, Document, DocumentStore,
    Query, StoreError, SUBMISSIONS,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) fn parse_submission(id: &str, data: &Document) -> ServiceResult<Submission> {
    let mut submission: Submission = from_document(data).map_err(|e| ServiceError::Malformed {
        entity: "submission",
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    submission.id = id.to_string();
    Ok(submission)
}

/// Whole seconds from `started_at` to `now`, rounded and never negative.
/// A submission with no recorded start counts as zero.
pub fn elapsed_seconds(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    let Some(started) = started_at else {
        return 0;
    };
    let millis = (now - started).num_milliseconds().max(0);
    ((millis + 500) / 1000) as u64
}

/// Starts, autosaves, grades and reads student attempts.
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn DocumentStore>,
    identity: IdentityResolver,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn DocumentStore>, identity: IdentityResolver) -> Self {
        Self { store, identity }
    }

    /// Opens an in-progress attempt and counts the student in the room.
    pub async fn start_submission(&self, new_submission: NewSubmission) -> ServiceResult<String> {
        self.identity.ensure_guest_signed_in().await?;

        let submission = new_submission.into_submission();
        let mut data = to_document(&submission)?;
        data.insert("startedAt".into(), server_timestamp());
        let id = self.store.add(SUBMISSIONS, data).await?;
        info!(
            submission_id = %id,
            room_id = %submission.room_id,
            student_id = %submission.student.id,
            "submission started"
        );

        bump_room_counter(self.store.as_ref(), &submission.room_id, RoomCounter::TotalStudents).await?;
        Ok(id)
    }

    /// Partial update, used to autosave answers while the attempt is open.
    /// The patch is applied to a copy of the stored record first and rejected
    /// when the result no longer reads as a submission.
    pub async fn update_submission(&self, submission_id: &str, patch: Document) -> ServiceResult<()> {
        let Some(current) = self.store.get(SUBMISSIONS, submission_id).await? else {
            return Err(ServiceError::not_found("submission", submission_id));
        };

        let mut patched = current.data;
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        for (path, value) in &patch {
            let mut value = value.clone();
            resolve_server_timestamps(&mut value, &stamp);
            set_field(&mut patched, path, value);
        }
        if let Err(err) = from_document::<Submission>(&patched) {
            warn!(submission_id, error = %err, "rejected autosave patch");
            return Err(ServiceError::Validation(vec![ValidationIssue {
                field: "patch".into(),
                issue: err.to_string(),
            }]));
        }

        self.write_fields(submission_id, patch).await?;
        debug!(submission_id, "submission autosaved");
        Ok(())
    }

    async fn write_fields(&self, submission_id: &str, fields: Document) -> ServiceResult<()> {
        self.store
            .update(SUBMISSIONS, submission_id, fields)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { id, .. } => ServiceError::not_found("submission", id),
                other => other.into(),
            })
    }

    /// Grades `answers` against `exam`, stores the result and counts the
    /// submission in its room. Running it twice on the same input yields the
    /// same score fields, but the room counter is bumped each time.
    pub async fn finalize_submission(
        &self,
        submission_id: &str,
        answers: AnswerMap,
        exam: &Exam,
    ) -> ServiceResult<Submission> {
        let Some(current) = self.get_submission(submission_id).await? else {
            return Err(ServiceError::not_found("submission", submission_id));
        };

        let summary = grade(exam, &answers);
        let duration = elapsed_seconds(current.started_at, Utc::now());

        let mut fields = Document::new();
        fields.insert("answers".into(), serde_json::to_value(&answers).map_err(StoreError::from)?);
        fields.insert("score".into(), Value::from(summary.correct_count));
        fields.insert("correctCount".into(), Value::from(summary.correct_count));
        fields.insert("wrongCount".into(), Value::from(summary.wrong_count));
        fields.insert("totalQuestions".into(), Value::from(summary.total_questions));
        fields.insert("percentage".into(), Value::from(summary.percentage));
        fields.insert("duration".into(), Value::from(duration));
        fields.insert(
            "status".into(),
            serde_json::to_value(SubmissionStatus::Submitted).map_err(StoreError::from)?,
        );
        fields.insert("submittedAt".into(), server_timestamp());
        self.write_fields(submission_id, fields).await?;

        info!(
            submission_id,
            room_id = %current.room_id,
            correct = summary.correct_count,
            total = summary.total_questions,
            percentage = summary.percentage,
            duration,
            "submission finalized"
        );

        bump_room_counter(self.store.as_ref(), &current.room_id, RoomCounter::SubmittedCount).await?;

        match self.get_submission(submission_id).await? {
            Some(scored) => Ok(scored),
            None => Err(ServiceError::not_found("submission", submission_id)),
        }
    }

    pub async fn get_submission(&self, submission_id: &str) -> ServiceResult<Option<Submission>> {
        match self.store.get(SUBMISSIONS, submission_id).await? {
            Some(snapshot) => parse_submission(&snapshot.id, &snapshot.data).map(Some),
            None => Ok(None),
        }
    }

    /// Highest percentage first; equal scores keep store order.
    pub async fn get_submissions_by_room(&self, room_id: &str) -> ServiceResult<Vec<Submission>> {
        let docs = self
            .store
            .query(&Query::collection(SUBMISSIONS).where_eq("roomId", room_id))
            .await?;
        let mut submissions = docs
            .iter()
            .map(|s| parse_submission(&s.id, &s.data))
            .collect::<ServiceResult<Vec<_>>>()?;
        submissions.sort_by_key(|s| Reverse(s.percentage));
        Ok(submissions)
    }

    pub async fn get_student_submission(&self, room_id: &str, student_id: &str) -> ServiceResult<Option<Submission>> {
        let query = Query::collection(SUBMISSIONS)
            .where_eq("roomId", room_id)
            .where_eq("student.id", student_id)
            .limit(1);
        let found = self.store.query(&query).await?;
        found
            .first()
            .map(|s| parse_submission(&s.id, &s.data))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::CodeAllocator;
    use crate::identity::LocalIdentityProvider;
    use crate::memory_store::InMemoryStore;
    use crate::models::{Question, QuestionType, StudentRef};
    use crate::rooms::RoomService;
    use chrono::Duration;
    use serde_json::{json, Map};

    struct Fixture {
        store: InMemoryStore,
        provider: LocalIdentityProvider,
        rooms: RoomService,
        submissions: SubmissionService,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
        let provider = LocalIdentityProvider::new();
        let identity = IdentityResolver::new(shared.clone(), Arc::new(provider.clone()));
        Fixture {
            store,
            provider,
            rooms: RoomService::new(shared.clone(), CodeAllocator::default()),
            submissions: SubmissionService::new(shared, identity),
        }
    }

    fn ten_question_exam() -> Exam {
        let mut exam: Exam = serde_json::from_value(json!({"title": "Grammar check"})).unwrap();
        exam.id = "e1".into();
        exam.questions = (1..=10)
            .map(|n| Question {
                number: n,
                kind: QuestionType::MultipleChoice,
                correct_answer: Some("B".into()),
                content: Map::new(),
            })
            .collect();
        exam
    }

    fn attempt(room_id: &str, student: &str) -> NewSubmission {
        NewSubmission {
            room_id: room_id.into(),
            room_code: "ABC234".into(),
            exam_id: "e1".into(),
            student: StudentRef {
                id: student.into(),
                name: student.to_uppercase(),
            },
            answers: AnswerMap::new(),
        }
    }

    fn seven_of_ten() -> AnswerMap {
        (1..=10)
            .map(|n| (n, if n <= 7 { "b".to_string() } else { "C".to_string() }))
            .collect()
    }

    #[test]
    fn elapsed_seconds_rounds_and_clamps() {
        let start = Utc::now();
        assert_eq!(elapsed_seconds(Some(start), start + Duration::milliseconds(1499)), 1);
        assert_eq!(elapsed_seconds(Some(start), start + Duration::milliseconds(1500)), 2);
        assert_eq!(elapsed_seconds(Some(start), start - Duration::seconds(5)), 0);
        assert_eq!(elapsed_seconds(None, start), 0);
    }

    #[tokio::test]
    async fn start_signs_in_guest_and_counts_student() {
        let fx = fixture();
        let room = fx.rooms.create_room(crate::rooms::tests::new_room("t1")).await.unwrap();

        let id = fx.submissions.start_submission(attempt(&room.id, "s1")).await.unwrap();
        let submission = fx.submissions.get_submission(&id).await.unwrap().unwrap();
        assert_eq!(submission.status, SubmissionStatus::InProgress);
        assert!(submission.started_at.is_some());
        assert!(submission.submitted_at.is_none());
        assert_eq!(submission.percentage, 0);

        fx.submissions.start_submission(attempt(&room.id, "s2")).await.unwrap();
        assert_eq!(fx.provider.anonymous_sign_in_count(), 1);
        let room = fx.rooms.get_room(&room.id).await.unwrap().unwrap();
        assert_eq!(room.total_students, 2);
    }

    #[tokio::test]
    async fn finalize_scores_seven_of_ten() {
        let fx = fixture();
        let room = fx.rooms.create_room(crate::rooms::tests::new_room("t1")).await.unwrap();
        let id = fx.submissions.start_submission(attempt(&room.id, "s1")).await.unwrap();

        let scored = fx
            .submissions
            .finalize_submission(&id, seven_of_ten(), &ten_question_exam())
            .await
            .unwrap();
        assert_eq!(scored.id, id);
        assert_eq!(scored.status, SubmissionStatus::Submitted);
        assert_eq!((scored.correct_count, scored.wrong_count), (7, 3));
        assert_eq!(scored.score, 7);
        assert_eq!(scored.total_questions, 10);
        assert_eq!(scored.percentage, 70);
        assert!(scored.submitted_at.unwrap() > scored.started_at.unwrap());
        assert_eq!(scored.answers.get(&1).map(String::as_str), Some("b"));

        let room = fx.rooms.get_room(&room.id).await.unwrap().unwrap();
        assert_eq!(room.submitted_count, 1);
    }

    #[tokio::test]
    async fn refinalizing_recomputes_same_score() {
        let fx = fixture();
        let room = fx.rooms.create_room(crate::rooms::tests::new_room("t1")).await.unwrap();
        let id = fx.submissions.start_submission(attempt(&room.id, "s1")).await.unwrap();
        let exam = ten_question_exam();

        let first = fx.submissions.finalize_submission(&id, seven_of_ten(), &exam).await.unwrap();
        let second = fx.submissions.finalize_submission(&id, seven_of_ten(), &exam).await.unwrap();
        assert_eq!(
            (first.correct_count, first.wrong_count, first.total_questions, first.percentage),
            (second.correct_count, second.wrong_count, second.total_questions, second.percentage)
        );
        let room = fx.rooms.get_room(&room.id).await.unwrap().unwrap();
        assert_eq!(room.submitted_count, 2);
    }

    #[tokio::test]
    async fn finalize_of_unknown_submission_fails() {
        let fx = fixture();
        let err = fx
            .submissions
            .finalize_submission("missing", AnswerMap::new(), &ten_question_exam())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { entity: "submission", .. }));
    }

    #[tokio::test]
    async fn autosave_patches_answers() {
        let fx = fixture();
        let id = fx.submissions.start_submission(attempt("gone", "s1")).await.unwrap();
        let patch = json!({"answers": {"1": "A"}}).as_object().cloned().unwrap();
        fx.submissions.update_submission(&id, patch).await.unwrap();
        assert_eq!(
            fx.store.field(SUBMISSIONS, &id, "answers.1").await,
            Some(json!("A"))
        );

        let err = fx.submissions.update_submission("missing", Document::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn autosave_rejects_patch_that_breaks_the_record() {
        let fx = fixture();
        let room = fx.rooms.create_room(crate::rooms::tests::new_room("t1")).await.unwrap();
        let id = fx.submissions.start_submission(attempt(&room.id, "s1")).await.unwrap();

        for bad in [json!({"answers": {"1": null}}), json!({"percentage": "high"}), json!({"student.id": 7})] {
            let patch = bad.as_object().cloned().unwrap();
            let err = fx.submissions.update_submission(&id, patch).await.unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{bad}");
        }

        // The stored record still reads, lists and grades.
        assert!(fx.submissions.get_submission(&id).await.unwrap().is_some());
        assert_eq!(fx.submissions.get_submissions_by_room(&room.id).await.unwrap().len(), 1);
        let scored = fx
            .submissions
            .finalize_submission(&id, seven_of_ten(), &ten_question_exam())
            .await
            .unwrap();
        assert_eq!(scored.percentage, 70);
    }

    #[tokio::test]
    async fn room_listing_and_student_lookup() {
        let fx = fixture();
        let room = fx.rooms.create_room(crate::rooms::tests::new_room("t1")).await.unwrap();
        let exam = ten_question_exam();
        let low = fx.submissions.start_submission(attempt(&room.id, "s1")).await.unwrap();
        let high = fx.submissions.start_submission(attempt(&room.id, "s2")).await.unwrap();
        fx.submissions.start_submission(attempt("other", "s2")).await.unwrap();

        fx.submissions.finalize_submission(&low, seven_of_ten(), &exam).await.unwrap();
        let all_right: AnswerMap = (1..=10).map(|n| (n, "B".to_string())).collect();
        fx.submissions.finalize_submission(&high, all_right, &exam).await.unwrap();

        let listed = fx.submissions.get_submissions_by_room(&room.id).await.unwrap();
        let percentages: Vec<u32> = listed.iter().map(|s| s.percentage).collect();
        assert_eq!(percentages, [100, 70]);

        let found = fx
            .submissions
            .get_student_submission(&room.id, "s2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, high);
        assert!(fx
            .submissions
            .get_student_submission(&room.id, "nobody")
            .await
            .unwrap()
            .is_none());
    }
}
