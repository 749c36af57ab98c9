use crate::models::{AnswerMap, Exam, Question, QuestionType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const APOSTROPHES: [char; 3] = ['\'', '\u{2018}', '\u{2019}'];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.,!?;:]").expect("static regex"));

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub correct_count: u32,
    pub wrong_count: u32,
    pub total_questions: u32,
    pub percentage: u32,
}

/// Canonical form of a free-text answer: lowercase, no apostrophes of any
/// style, single spaces, no `.,!?;:` and no outer whitespace.
pub fn normalize_writing(text: &str) -> String {
    let lowered = text.to_lowercase().replace(APOSTROPHES, "");
    let collapsed = WHITESPACE.replace_all(&lowered, " ");
    PUNCTUATION.replace_all(&collapsed, "").trim().to_string()
}

/// Blank answers or keys never count as correct.
pub fn is_correct(question: &Question, submitted: Option<&str>) -> bool {
    let Some(submitted) = submitted.filter(|s| !s.is_empty()) else {
        return false;
    };
    let Some(key) = question.correct_answer.as_deref().filter(|k| !k.is_empty()) else {
        return false;
    };
    match question.kind {
        QuestionType::Writing => normalize_writing(submitted) == normalize_writing(key),
        _ => submitted.to_uppercase() == key.to_uppercase(),
    }
}

/// `round(correct / total * 100)` with halves rounded up; 0 for an empty exam.
pub fn percentage(correct: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let (correct, total) = (u64::from(correct), u64::from(total));
    ((correct * 200 + total) / (total * 2)) as u32
}

pub fn grade(exam: &Exam, answers: &AnswerMap) -> ScoreSummary {
    let mut questions: Vec<&Question> = exam.questions.iter().collect();
    questions.sort_by_key(|q| q.number);

    let total_questions = questions.len() as u32;
    let correct_count = questions
        .iter()
        .filter(|q| is_correct(q, answers.get(&q.number).map(String::as_str)))
        .count() as u32;

    ScoreSummary {
        correct_count,
        wrong_count: total_questions - correct_count,
        total_questions,
        percentage: percentage(correct_count, total_questions),
    }
}
