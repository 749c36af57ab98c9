use crate::error::{ServiceError, ServiceResult};
use crate::models::{validate_exam, Exam, NewExam};
use crate::store::{from_document, server_timestamp, to_document, Document, DocumentStore, Query, EXAMS};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::info;

pub(crate) fn parse_exam(id: &str, data: &Document) -> ServiceResult<Exam> {
    let mut exam: Exam = from_document(data).map_err(|e| ServiceError::Malformed {
        entity: "exam",
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    exam.id = id.to_string();
    Ok(exam)
}

/// Read-mostly storage of exam definitions.
#[derive(Clone)]
pub struct ExamRepository {
    store: Arc<dyn DocumentStore>,
}

impl ExamRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn create_exam(&self, exam: NewExam) -> ServiceResult<String> {
        validate_exam(&exam).map_err(ServiceError::Validation)?;
        let mut data = to_document(&exam)?;
        data.insert("createdAt".into(), server_timestamp());
        data.insert("updatedAt".into(), server_timestamp());
        let id = self.store.add(EXAMS, data).await?;
        info!(exam_id = %id, created_by = %exam.created_by, questions = exam.questions.len(), "exam created");
        Ok(id)
    }

    pub async fn get_exam(&self, exam_id: &str) -> ServiceResult<Option<Exam>> {
        match self.store.get(EXAMS, exam_id).await? {
            Some(snapshot) => parse_exam(&snapshot.id, &snapshot.data).map(Some),
            None => Ok(None),
        }
    }

    /// Newest first; exams without a creation time go last.
    pub async fn get_exams_by_teacher(&self, teacher_id: &str) -> ServiceResult<Vec<Exam>> {
        let docs = self
            .store
            .query(&Query::collection(EXAMS).where_eq("createdBy", teacher_id))
            .await?;
        let mut exams = docs
            .iter()
            .map(|s| parse_exam(&s.id, &s.data))
            .collect::<ServiceResult<Vec<_>>>()?;
        exams.sort_by_key(|e| Reverse(e.created_at));
        Ok(exams)
    }

    pub async fn delete_exam(&self, exam_id: &str) -> ServiceResult<()> {
        self.store.delete(EXAMS, exam_id).await?;
        info!(exam_id, "exam deleted");
        Ok(())
    }
}
