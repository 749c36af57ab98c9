use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_TIME_LIMIT_MINUTES: u32 = 45;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Answers keyed by question number.
pub type AnswerMap = BTreeMap<u32, String>;

fn default_true() -> bool {
    true
}

fn default_time_limit() -> u32 {
    DEFAULT_TIME_LIMIT_MINUTES
}

/// Stored records with a zero or null limit read as the default.
fn time_limit_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(Option::<u32>::deserialize(deserializer)?
        .filter(|minutes| *minutes > 0)
        .unwrap_or(DEFAULT_TIME_LIMIT_MINUTES))
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Leader,
    #[default]
    Teacher,
    Student,
    Guest,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::Leader)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Writing,
    #[default]
    MultipleChoice,
    /// Any other objective type, kept verbatim.
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub number: u32,
    #[serde(rename = "type", default)]
    pub kind: QuestionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<String>,
    /// Prompt, choices and anything else the UI renders.
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_time_limit", deserialize_with = "time_limit_or_default")]
    pub time_limit: u32,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub sections: Vec<Value>,
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub images: Vec<Value>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Exam as authored, before the store assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewExam {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_time_limit")]
    pub time_limit: u32,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub sections: Vec<Value>,
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub images: Vec<Value>,
    pub created_by: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Public,
    Class,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Waiting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub exam_id: String,
    #[serde(default)]
    pub exam_title: String,
    #[serde(default)]
    pub teacher_id: String,
    #[serde(default)]
    pub teacher_name: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_time_limit", deserialize_with = "time_limit_or_default")]
    pub time_limit: u32,
    #[serde(default = "default_true")]
    pub allow_late_join: bool,
    #[serde(default = "default_true")]
    pub show_result_after_submit: bool,
    #[serde(default)]
    pub shuffle_questions: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub total_students: u32,
    #[serde(default)]
    pub submitted_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub allow_late_join: Option<bool>,
    pub show_result_after_submit: Option<bool>,
    pub shuffle_questions: Option<bool>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewRoom {
    pub exam_id: String,
    pub exam_title: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub time_limit: u32,
    #[serde(default)]
    pub access_mode: Option<AccessMode>,
    #[serde(default)]
    pub class_id: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub settings: RoomSettings,
}

impl NewRoom {
    /// Applies room defaults; timestamps are left to the store.
    pub fn into_room(self, code: String) -> Room {
        Room {
            id: String::new(),
            code,
            exam_id: self.exam_id,
            exam_title: self.exam_title,
            teacher_id: self.teacher_id,
            teacher_name: self.teacher_name,
            access_mode: self.access_mode.unwrap_or_default(),
            class_id: self.class_id,
            class_name: self.class_name,
            status: RoomStatus::Waiting,
            start_time: None,
            end_time: None,
            time_limit: self.time_limit,
            allow_late_join: self.settings.allow_late_join.unwrap_or(true),
            show_result_after_submit: self.settings.show_result_after_submit.unwrap_or(true),
            shuffle_questions: self.settings.shuffle_questions.unwrap_or(false),
            max_attempts: self.settings.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            total_students: 0,
            submitted_count: 0,
            created_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StudentRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    #[default]
    InProgress,
    Submitted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub room_code: String,
    #[serde(default)]
    pub exam_id: String,
    #[serde(default)]
    pub student: StudentRef,
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub correct_count: u32,
    #[serde(default)]
    pub wrong_count: u32,
    #[serde(default)]
    pub total_questions: u32,
    #[serde(default)]
    pub percentage: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Whole seconds between start and submission.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmission {
    pub room_id: String,
    pub room_code: String,
    pub exam_id: String,
    pub student: StudentRef,
    #[serde(default)]
    pub answers: AnswerMap,
}

impl NewSubmission {
    pub fn into_submission(self) -> Submission {
        Submission {
            id: String::new(),
            room_id: self.room_id,
            room_code: self.room_code,
            exam_id: self.exam_id,
            student: self.student,
            answers: self.answers,
            score: 0,
            correct_count: 0,
            wrong_count: 0,
            total_questions: 0,
            percentage: 0,
            started_at: None,
            submitted_at: None,
            duration: 0,
            status: SubmissionStatus::InProgress,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

pub fn validate_exam(exam: &NewExam) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if exam.title.trim().is_empty() {
        issues.push(ValidationIssue {
            field: "title".into(),
            issue: "must not be empty".into(),
        });
    }
    if exam.created_by.trim().is_empty() {
        issues.push(ValidationIssue {
            field: "createdBy".into(),
            issue: "must not be empty".into(),
        });
    }
    if exam.time_limit == 0 {
        issues.push(ValidationIssue {
            field: "timeLimit".into(),
            issue: "must be positive".into(),
        });
    }
    if exam.questions.is_empty() {
        issues.push(ValidationIssue {
            field: "questions".into(),
            issue: "must contain at least one question".into(),
        });
    }
    let mut numbers = HashSet::new();
    for (i, q) in exam.questions.iter().enumerate() {
        if !numbers.insert(q.number) {
            issues.push(ValidationIssue {
                field: format!("questions[{i}].number"),
                issue: "must be unique".into(),
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::from_document;
    use serde_json::json;

    fn question(number: u32) -> Question {
        Question {
            number,
            kind: QuestionType::MultipleChoice,
            correct_answer: Some("A".into()),
            content: Map::new(),
        }
    }

    #[test]
    fn room_record_defaults_fill_missing_fields() {
        let raw = json!({"code": "ABC234", "examId": "e1"});
        let room: Room = from_document(raw.as_object().unwrap()).unwrap();
        assert_eq!(room.access_mode, AccessMode::Public);
        assert_eq!(room.status, RoomStatus::Waiting);
        assert_eq!(room.time_limit, 45);
        assert!(room.allow_late_join);
        assert!(room.show_result_after_submit);
        assert!(!room.shuffle_questions);
        assert_eq!(room.max_attempts, 1);
        assert_eq!(room.total_students, 0);
    }

    #[test]
    fn zero_or_null_time_limit_reads_as_default() {
        for raw in [json!({"timeLimit": 0}), json!({"timeLimit": null})] {
            let room: Room = from_document(raw.as_object().unwrap()).unwrap();
            assert_eq!(room.time_limit, 45, "{raw}");
            let exam: Exam = from_document(raw.as_object().unwrap()).unwrap();
            assert_eq!(exam.time_limit, 45, "{raw}");
        }
        let room: Room = from_document(json!({"timeLimit": 30}).as_object().unwrap()).unwrap();
        assert_eq!(room.time_limit, 30);
    }

    #[test]
    fn new_room_settings_override_defaults() {
        let new_room = NewRoom {
            exam_id: "e1".into(),
            exam_title: "Unit 1".into(),
            teacher_id: "t1".into(),
            teacher_name: "T".into(),
            time_limit: 30,
            access_mode: Some(AccessMode::Class),
            class_id: Some("c1".into()),
            class_name: None,
            settings: RoomSettings {
                shuffle_questions: Some(true),
                max_attempts: Some(3),
                ..Default::default()
            },
        };
        let room = new_room.into_room("XYZ234".into());
        assert_eq!(room.access_mode, AccessMode::Class);
        assert!(room.shuffle_questions);
        assert!(room.allow_late_join);
        assert_eq!(room.max_attempts, 3);
        assert_eq!(room.time_limit, 30);
    }

    #[test]
    fn question_type_keeps_unknown_kinds() {
        let raw = json!({"number": 3, "type": "true_false", "correctAnswer": "T", "prompt": "?"});
        let q: Question = serde_json::from_value(raw).unwrap();
        assert_eq!(q.kind, QuestionType::Other("true_false".into()));
        assert_eq!(q.content["prompt"], json!("?"));
        let back = serde_json::to_value(&q).unwrap();
        assert_eq!(back["type"], json!("true_false"));

        let writing: Question = serde_json::from_value(json!({"number": 1, "type": "writing"})).unwrap();
        assert_eq!(writing.kind, QuestionType::Writing);
    }

    #[test]
    fn submission_answers_use_numeric_keys() {
        let raw = json!({"roomId": "r1", "answers": {"1": "A", "10": "b"}, "status": "submitted"});
        let sub: Submission = from_document(raw.as_object().unwrap()).unwrap();
        assert_eq!(sub.answers.get(&10).map(String::as_str), Some("b"));
        assert_eq!(sub.status, SubmissionStatus::Submitted);
        assert_eq!(sub.percentage, 0);
    }

    #[test]
    fn user_defaults_to_unapproved_teacher() {
        let raw = json!({"name": "Lan"});
        let user: User = from_document(raw.as_object().unwrap()).unwrap();
        assert_eq!(user.role, Role::Teacher);
        assert!(!user.is_approved);
        assert!(Role::Leader.is_admin());
        assert!(!Role::Teacher.is_admin());
    }

    #[test]
    fn validate_exam_reports_every_issue() {
        let exam = NewExam {
            title: " ".into(),
            description: None,
            time_limit: 0,
            questions: vec![question(1), question(1)],
            sections: vec![],
            answers: AnswerMap::new(),
            images: vec![],
            created_by: "t1".into(),
        };
        let issues = validate_exam(&exam).unwrap_err();
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().any(|i| i.field == "questions[1].number"));
    }
}
