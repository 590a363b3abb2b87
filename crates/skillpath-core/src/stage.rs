use serde::{Deserialize, Serialize};

/// The fixed set of pipeline stages. The name is the discriminator for the
/// persisted payload shape and determines the storage order.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    QuestionClassification,
    SkillExtraction,
    CourseRetrieval,
    RelevanceFiltering,
    CourseRelevanceFiltering,
    CourseAggregation,
    AnswerGeneration,
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        Self::QuestionClassification,
        Self::SkillExtraction,
        Self::CourseRetrieval,
        Self::RelevanceFiltering,
        Self::CourseRelevanceFiltering,
        Self::CourseAggregation,
        Self::AnswerGeneration,
    ];

    /// Storage order, 1..7. A pure function of the name: a stage may run more
    /// than once per run (e.g. retries), so order is not a uniqueness key.
    pub fn order(&self) -> u8 {
        match self {
            Self::QuestionClassification => 1,
            Self::SkillExtraction => 2,
            Self::CourseRetrieval => 3,
            Self::RelevanceFiltering => 4,
            Self::CourseRelevanceFiltering => 5,
            Self::CourseAggregation => 6,
            Self::AnswerGeneration => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuestionClassification => "question_classification",
            Self::SkillExtraction => "skill_extraction",
            Self::CourseRetrieval => "course_retrieval",
            Self::RelevanceFiltering => "relevance_filtering",
            Self::CourseRelevanceFiltering => "course_relevance_filtering",
            Self::CourseAggregation => "course_aggregation",
            Self::AnswerGeneration => "answer_generation",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question_classification" => Ok(Self::QuestionClassification),
            "skill_extraction" => Ok(Self::SkillExtraction),
            "course_retrieval" => Ok(Self::CourseRetrieval),
            "relevance_filtering" => Ok(Self::RelevanceFiltering),
            "course_relevance_filtering" => Ok(Self::CourseRelevanceFiltering),
            "course_aggregation" => Ok(Self::CourseAggregation),
            "answer_generation" => Ok(Self::AnswerGeneration),
            other => Err(format!("unknown stage name: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn orders_are_1_through_7() {
        let orders: Vec<u8> = StageName::ALL.iter().map(|s| s.order()).collect();
        assert_eq!(orders, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        for stage in StageName::ALL {
            let parsed = StageName::from_str(stage.as_str()).unwrap();
            assert_eq!(parsed, stage);
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(StageName::from_str("NOT_A_STAGE").is_err());
        assert!(StageName::from_str("").is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&StageName::CourseRetrieval).unwrap();
        assert_eq!(json, "\"course_retrieval\"");
        let parsed: StageName = serde_json::from_str("\"answer_generation\"").unwrap();
        assert_eq!(parsed, StageName::AnswerGeneration);
    }
}
