use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieverType {
    Keywords,
    Vector,
}

impl RetrieverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieverType::Keywords => "keywords",
            RetrieverType::Vector => "vector",
        }
    }
}

/// One retrieval back-end: which engine, and which kind of index inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectiveEngine {
    pub retriever_type: RetrieverType,
    pub engine_type: String,
}

impl EffectiveEngine {
    pub fn new(engine_type: impl Into<String>, retriever_type: RetrieverType) -> Self {
        Self {
            retriever_type,
            engine_type: engine_type.into(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.engine_type, self.retriever_type.as_str())
    }
}

impl fmt::Display for EffectiveEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.engine_type, self.retriever_type.as_str())
    }
}

impl FromStr for EffectiveEngine {
    type Err = AppError;

    /// Parses `engine_type:retriever_type`, e.g. `elasticsearch:keywords`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (engine, retriever) = s
            .split_once(':')
            .ok_or_else(|| AppError::Validation(format!("invalid engine descriptor: {s}")))?;
        let retriever_type = match retriever.trim() {
            "keywords" => RetrieverType::Keywords,
            "vector" => RetrieverType::Vector,
            other => {
                return Err(AppError::Validation(format!(
                    "unknown retriever type: {other}"
                )))
            }
        };
        let engine = engine.trim();
        if engine.is_empty() {
            return Err(AppError::Validation(format!("invalid engine descriptor: {s}")));
        }
        Ok(Self::new(engine, retriever_type))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFailure {
    pub engine: EffectiveEngine,
    pub error: String,
}

/// Outcome of fanning one operation out to several engines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineReport {
    pub succeeded: Vec<EffectiveEngine>,
    pub failed: Vec<EngineFailure>,
}

impl EngineReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_engines(&self) -> Vec<EffectiveEngine> {
        self.failed.iter().map(|f| f.engine.clone()).collect()
    }

    pub fn summary(&self) -> String {
        let succeeded: Vec<String> = self.succeeded.iter().map(EffectiveEngine::name).collect();
        let failed: Vec<String> = self
            .failed
            .iter()
            .map(|f| format!("{} ({})", f.engine.name(), f.error))
            .collect();
        format!(
            "succeeded [{}], failed [{}]",
            succeeded.join(", "),
            failed.join(", ")
        )
    }

    /// Fold a later retry's report into this one.
    pub fn merge(&mut self, other: EngineReport) {
        for engine in other.succeeded {
            self.failed.retain(|f| f.engine != engine);
            if !self.succeeded.contains(&engine) {
                self.succeeded.push(engine);
            }
        }
        for failure in other.failed {
            self.failed.retain(|f| f.engine != failure.engine);
            self.failed.push(failure);
        }
    }
}
