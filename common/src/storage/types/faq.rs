use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerStrategy {
    #[default]
    All,
    Random,
}

impl FromStr for AnswerStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" => Ok(AnswerStrategy::All),
            "random" => Ok(AnswerStrategy::Random),
            other => Err(AppError::Validation(format!(
                "invalid answer strategy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    #[default]
    Append,
    Replace,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Append => "append",
            ImportMode::Replace => "replace",
        }
    }
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqChunkMetadata {
    pub standard_question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similar_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub negative_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<String>,
    #[serde(default)]
    pub answer_strategy: AnswerStrategy,
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl FaqChunkMetadata {
    /// Trim every string, drop empties and duplicates (first occurrence wins).
    pub fn normalize(&mut self) {
        self.standard_question = self.standard_question.trim().to_string();
        self.similar_questions = normalize_strings(&self.similar_questions);
        self.negative_questions = normalize_strings(&self.negative_questions);
        self.answers = normalize_strings(&self.answers);
        if self.version == 0 {
            self.version = 1;
        }
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// SHA-256 over the normalized question/answer sets. List order does not matter.
    pub fn content_hash(&self) -> String {
        let normalized = self.clone().normalized();

        let joined = |values: &[String]| {
            let mut sorted = values.to_vec();
            sorted.sort();
            sorted.join(",")
        };

        let material = format!(
            "{}|{}|{}|{}",
            normalized.standard_question,
            joined(&normalized.similar_questions),
            joined(&normalized.negative_questions),
            joined(&normalized.answers),
        );

        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn normalize_strings(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .filter(|value| seen.insert(value.to_string()))
        .map(str::to_string)
        .collect()
}

/// One FAQ entry as submitted for import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqEntryPayload {
    /// Explicit sequence id, used when migrating entries between stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub standard_question: String,
    #[serde(default)]
    pub similar_questions: Vec<String>,
    #[serde(default)]
    pub negative_questions: Vec<String>,
    #[serde(default)]
    pub answers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_recommended: Option<bool>,
}

impl FaqEntryPayload {
    /// Normalize the entry into chunk metadata, or return the rejection reason.
    pub fn validate(&self) -> Result<FaqChunkMetadata, String> {
        let answer_strategy = match self.answer_strategy.as_deref() {
            None | Some("") => AnswerStrategy::All,
            Some(raw) => raw
                .parse::<AnswerStrategy>()
                .map_err(|_| format!("invalid answer strategy: {raw}"))?,
        };

        let metadata = FaqChunkMetadata {
            standard_question: self.standard_question.clone(),
            similar_questions: self.similar_questions.clone(),
            negative_questions: self.negative_questions.clone(),
            answers: self.answers.clone(),
            answer_strategy,
            version: 1,
            source: None,
        }
        .normalized();

        if metadata.standard_question.is_empty() {
            return Err("standard question required".to_string());
        }
        if metadata.answers.is_empty() {
            return Err("answers required".to_string());
        }

        Ok(metadata)
    }
}

/// A rejected entry, carrying enough of the submission to fix and resubmit it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqFailedEntry {
    /// Position in the submitted batch, 0-based.
    pub index: usize,
    pub reason: String,
    #[serde(default)]
    pub standard_question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similar_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub negative_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<String>,
    #[serde(default)]
    pub answer_all: bool,
    #[serde(default)]
    pub is_disabled: bool,
}

impl FaqFailedEntry {
    pub fn rejected(index: usize, entry: &FaqEntryPayload, reason: String) -> Self {
        let answer_all = match entry.answer_strategy.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(raw) => matches!(raw.parse::<AnswerStrategy>(), Ok(AnswerStrategy::All)),
        };
        Self {
            index,
            reason,
            standard_question: entry.standard_question.trim().to_string(),
            tag_name: entry.tag_name.clone(),
            similar_questions: entry.similar_questions.clone(),
            negative_questions: entry.negative_questions.clone(),
            answers: entry.answers.clone(),
            answer_all,
            is_disabled: entry.is_enabled == Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqSuccessEntry {
    pub index: usize,
    pub seq_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    pub standard_question: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(similar: &[&str], answers: &[&str]) -> FaqChunkMetadata {
        FaqChunkMetadata {
            standard_question: "How do I reset my password?".into(),
            similar_questions: similar.iter().map(|s| (*s).to_string()).collect(),
            negative_questions: vec![],
            answers: answers.iter().map(|s| (*s).to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn normalize_trims_and_dedupes() {
        let mut m = FaqChunkMetadata {
            standard_question: "  Q  ".into(),
            similar_questions: vec![" a".into(), "a ".into(), String::new(), "b".into()],
            answers: vec!["x".into(), "  ".into()],
            ..Default::default()
        };
        m.normalize();

        assert_eq!(m.standard_question, "Q");
        assert_eq!(m.similar_questions, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(m.answers, vec!["x".to_string()]);
        assert_eq!(m.version, 1);
    }

    #[test]
    fn hash_ignores_order_and_whitespace() {
        let a = meta(&["forgot password", "reset login"], &["Use the reset link"]);
        let b = meta(&[" reset login ", "forgot password", "forgot password"], &[
            "Use the reset link ",
        ]);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn hash_changes_with_each_field() {
        let base = meta(&["forgot password"], &["Use the reset link"]);
        let hash = base.content_hash();

        let mut changed = base.clone();
        changed.standard_question = "How do I change my password?".into();
        assert_ne!(hash, changed.content_hash());

        let mut changed = base.clone();
        changed.similar_questions.push("locked out".into());
        assert_ne!(hash, changed.content_hash());

        let mut changed = base.clone();
        changed.negative_questions.push("reset router".into());
        assert_ne!(hash, changed.content_hash());

        let mut changed = base;
        changed.answers.push("Contact support".into());
        assert_ne!(hash, changed.content_hash());
    }

    #[test]
    fn hash_is_sha256_of_sorted_fields() {
        let m = FaqChunkMetadata {
            standard_question: "q".into(),
            similar_questions: vec!["b".into(), "a".into()],
            negative_questions: vec![],
            answers: vec!["x".into()],
            ..Default::default()
        };
        let mut hasher = Sha256::new();
        hasher.update(b"q|a,b||x");
        assert_eq!(m.content_hash(), format!("{:x}", hasher.finalize()));
    }

    #[test]
    fn validation_reports_reasons() {
        let missing_question = FaqEntryPayload {
            standard_question: "   ".into(),
            answers: vec!["a".into()],
            ..Default::default()
        };
        assert_eq!(
            missing_question.validate().unwrap_err(),
            "standard question required"
        );

        let missing_answers = FaqEntryPayload {
            standard_question: "q".into(),
            answers: vec![" ".into()],
            ..Default::default()
        };
        assert_eq!(missing_answers.validate().unwrap_err(), "answers required");

        let bad_strategy = FaqEntryPayload {
            standard_question: "q".into(),
            answers: vec!["a".into()],
            answer_strategy: Some("sometimes".into()),
            ..Default::default()
        };
        assert_eq!(
            bad_strategy.validate().unwrap_err(),
            "invalid answer strategy: sometimes"
        );

        let ok = FaqEntryPayload {
            standard_question: "q".into(),
            answers: vec!["a".into()],
            answer_strategy: Some("random".into()),
            ..Default::default()
        };
        let metadata = ok.validate().expect("valid entry");
        assert_eq!(metadata.answer_strategy, AnswerStrategy::Random);
    }
}
