//! Stage output registry: validates and reconstructs a stage's payload by
//! dispatching exhaustively on the stage name. Each stage has a
//! schema-validated shape except `course_relevance_filtering`, whose payload
//! is produced internally (not from a model response) and is accepted with
//! defaulted fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec;
use crate::errors::TraceError;
use crate::stage::StageName;

/// One retrievable course.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Dedicated keyed collection: skill name → courses. Serialization in both
/// directions goes through the keyed-collection codec, so the collection
/// survives the flat-document round trip with identical key→value pairs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SkillCourses(BTreeMap<String, Vec<Course>>);

impl SkillCourses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, skill: impl Into<String>, courses: Vec<Course>) {
        self.0.insert(skill.into(), courses);
    }

    pub fn get(&self, skill: &str) -> Option<&[Course]> {
        self.0.get(skill).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn skills(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Course])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl FromIterator<(String, Vec<Course>)> for SkillCourses {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Course>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for SkillCourses {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let document = codec::flatten(&self.0).map_err(serde::ser::Error::custom)?;
        document.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SkillCourses {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let document = Map::<String, Value>::deserialize(deserializer)?;
        codec::unflatten_typed(&document)
            .map(SkillCourses)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutput {
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkillExtractionOutput {
    pub skills: Vec<String>,
    #[serde(default)]
    pub normalized: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CourseRetrievalOutput {
    pub courses_by_skill: SkillCourses,
    pub total_candidates: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelevanceFilteringOutput {
    pub evaluated_count: u64,
    /// Absent in some persisted rows; always reconstructed as a (possibly
    /// empty) collection so callers get a uniform non-optional type.
    #[serde(default)]
    pub relevant_by_skill: SkillCourses,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkillCount {
    pub skill: String,
    pub kept: u64,
}

/// Produced internally by threshold filtering over relevance scores, never
/// from a model response; every field is defaulted and an empty document is
/// accepted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CourseRelevanceFilteringOutput {
    #[serde(default)]
    pub kept: u64,
    #[serde(default)]
    pub dropped: u64,
    #[serde(default)]
    pub per_skill_kept: Vec<SkillCount>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CourseAggregationOutput {
    pub selected_by_skill: SkillCourses,
    pub total_selected: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnswerGenerationOutput {
    pub answer: String,
    #[serde(default)]
    pub recommended_course_ids: Vec<String>,
}

/// Typed stage payload: one variant per member of the fixed stage
/// enumeration. Adding or removing a stage is a compile-time-checked change
/// everywhere payloads are consumed.
#[derive(Clone, Debug, PartialEq)]
pub enum StageOutput {
    QuestionClassification(ClassificationOutput),
    SkillExtraction(SkillExtractionOutput),
    CourseRetrieval(CourseRetrievalOutput),
    RelevanceFiltering(RelevanceFilteringOutput),
    CourseRelevanceFiltering(CourseRelevanceFilteringOutput),
    CourseAggregation(CourseAggregationOutput),
    AnswerGeneration(AnswerGenerationOutput),
}

impl StageOutput {
    pub fn stage_name(&self) -> StageName {
        match self {
            Self::QuestionClassification(_) => StageName::QuestionClassification,
            Self::SkillExtraction(_) => StageName::SkillExtraction,
            Self::CourseRetrieval(_) => StageName::CourseRetrieval,
            Self::RelevanceFiltering(_) => StageName::RelevanceFiltering,
            Self::CourseRelevanceFiltering(_) => StageName::CourseRelevanceFiltering,
            Self::CourseAggregation(_) => StageName::CourseAggregation,
            Self::AnswerGeneration(_) => StageName::AnswerGeneration,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    stage: StageName,
    raw: &Value,
) -> Result<T, TraceError> {
    serde_json::from_value(raw.clone()).map_err(|e| TraceError::Validation {
        stage: stage.as_str(),
        detail: e.to_string(),
    })
}

/// Reconstruct a typed payload from a persisted raw value.
pub fn parse(stage: StageName, raw: &Value) -> Result<StageOutput, TraceError> {
    match stage {
        StageName::QuestionClassification => {
            decode(stage, raw).map(StageOutput::QuestionClassification)
        }
        StageName::SkillExtraction => decode(stage, raw).map(StageOutput::SkillExtraction),
        StageName::CourseRetrieval => decode(stage, raw).map(StageOutput::CourseRetrieval),
        StageName::RelevanceFiltering => decode(stage, raw).map(StageOutput::RelevanceFiltering),
        StageName::CourseRelevanceFiltering => {
            decode(stage, raw).map(StageOutput::CourseRelevanceFiltering)
        }
        StageName::CourseAggregation => decode(stage, raw).map(StageOutput::CourseAggregation),
        StageName::AnswerGeneration => decode(stage, raw).map(StageOutput::AnswerGeneration),
    }
}

/// [`parse`] with a stringly discriminator, as read from storage. A name
/// outside the fixed enumeration is a fatal data-integrity error.
pub fn parse_output(name: &str, raw: &Value) -> Result<StageOutput, TraceError> {
    let stage: StageName = name
        .parse()
        .map_err(|_| TraceError::UnknownStage(name.to_string()))?;
    parse(stage, raw)
}
