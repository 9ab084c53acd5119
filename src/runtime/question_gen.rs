//! Question generator - one LLM call producing N ranked questions

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::config::ProbeConfig;
use crate::dataset::{Dataset, Metadata};
use crate::error::{ProbeError, Result};
use crate::llm::{call_structured, ChatRequest, LlmClient, RetryPolicy};
use crate::model::{DifficultyLevel, Question};

use super::prompts;

#[derive(Debug, Deserialize)]
struct QuestionsResponse {
    #[serde(default)]
    questions: Vec<RawQuestion>,
}

#[derive(Debug, Deserialize)]
struct RawQuestion {
    #[serde(default)]
    id: String,
    text: String,
    #[serde(default)]
    difficulty_rank: u32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    relevant_data_keys: Vec<String>,
}

pub struct QuestionGenerator {
    llm: Arc<dyn LlmClient>,
    config: ProbeConfig,
    retry: RetryPolicy,
}

impl QuestionGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, config: ProbeConfig, retry: RetryPolicy) -> Self {
        Self { llm, config, retry }
    }

    /// One LLM call; failures here are run-fatal (there is no fallback for
    /// having no questions).
    pub async fn generate(&self, dataset: &Dataset, metadata: &Metadata) -> Result<Vec<Question>> {
        let count = self.config.question_count;
        let request = ChatRequest::new(
            prompts::question_gen_system(count),
            prompts::build_question_gen_prompt(dataset, metadata, count),
            self.config.question_temperature,
        );

        let response: QuestionsResponse =
            call_structured(self.llm.as_ref(), &request, &self.retry)
                .await
                .map_err(|e| ProbeError::QuestionGenFailed {
                    reason: e.to_string(),
                })?;

        let questions = normalize(response.questions);
        if questions.is_empty() {
            return Err(ProbeError::NoQuestions);
        }

        info!(count = questions.len(), "questions generated");
        Ok(questions)
    }
}

/// Enforce the generator guarantees regardless of model sloppiness:
/// ascending contiguous ranks 1..N, levels bucketed by rank, unique ids.
fn normalize(mut raw: Vec<RawQuestion>) -> Vec<Question> {
    raw.retain(|q| !q.text.trim().is_empty());
    raw.sort_by_key(|q| q.difficulty_rank);

    let total = raw.len();
    let mut seen_ids = std::collections::BTreeSet::new();

    raw.into_iter()
        .enumerate()
        .map(|(idx, q)| {
            let rank = idx as u32 + 1;
            let mut id = q.id.trim().to_string();
            if id.is_empty() || !seen_ids.insert(id.clone()) {
                id = format!("q_{rank:02}");
                seen_ids.insert(id.clone());
            }
            Question {
                id,
                text: q.text,
                difficulty_rank: rank,
                difficulty_level: DifficultyLevel::from_rank(rank, total),
                reasoning: q.reasoning,
                relevant_data_keys: q.relevant_data_keys,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;
    use serde_json::json;

    fn dataset() -> Dataset {
        json!({"total": 42}).as_object().unwrap().clone()
    }

    fn generator(mock: Arc<MockClient>, count: usize) -> QuestionGenerator {
        let config = ProbeConfig {
            question_count: count,
            ..ProbeConfig::default()
        };
        QuestionGenerator::new(mock, config, RetryPolicy::fast_for_tests())
    }

    #[tokio::test]
    async fn parses_and_sorts_questions() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(json!({"questions": [
            {"id": "q_02", "text": "Hard one", "difficulty_rank": 2,
             "difficulty_level": "hard", "reasoning": "multi-step"},
            {"id": "q_01", "text": "Easy one", "difficulty_rank": 1,
             "difficulty_level": "easy", "reasoning": "lookup",
             "relevant_data_keys": ["total"]}
        ]}));

        let questions = generator(mock, 2)
            .generate(&dataset(), &Metadata::default())
            .await
            .unwrap();

        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "q_01");
        assert_eq!(questions[0].difficulty_rank, 1);
        assert_eq!(questions[1].difficulty_rank, 2);
        assert_eq!(questions[0].relevant_data_keys, vec!["total"]);
    }

    #[tokio::test]
    async fn renumbers_sloppy_ranks_and_rebuckets_levels() {
        let mock = Arc::new(MockClient::new());
        // Ranks 3/7/9 with bogus levels: must come out 1..3 with derived levels
        mock.push_json(json!({"questions": [
            {"id": "a", "text": "t1", "difficulty_rank": 9, "difficulty_level": "easy"},
            {"id": "b", "text": "t2", "difficulty_rank": 3, "difficulty_level": "hard"},
            {"id": "c", "text": "t3", "difficulty_rank": 7, "difficulty_level": "hard"}
        ]}));

        let questions = generator(mock, 3)
            .generate(&dataset(), &Metadata::default())
            .await
            .unwrap();

        let ranks: Vec<u32> = questions.iter().map(|q| q.difficulty_rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(questions[0].difficulty_level, DifficultyLevel::Easy);
        assert_eq!(questions[2].difficulty_level, DifficultyLevel::Hard);
        assert_eq!(questions[0].text, "t2");
    }

    #[tokio::test]
    async fn duplicate_ids_are_regenerated() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(json!({"questions": [
            {"id": "dup", "text": "t1", "difficulty_rank": 1},
            {"id": "dup", "text": "t2", "difficulty_rank": 2}
        ]}));

        let questions = generator(mock, 2)
            .generate(&dataset(), &Metadata::default())
            .await
            .unwrap();

        assert_ne!(questions[0].id, questions[1].id);
    }

    #[tokio::test]
    async fn transport_exhaustion_is_question_gen_failure() {
        let mock = Arc::new(MockClient::new());
        for _ in 0..3 {
            mock.push_transport_failure("429");
        }
        let err = generator(mock, 2)
            .generate(&dataset(), &Metadata::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROBE-010");
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn empty_question_list_is_an_error() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(json!({"questions": []}));
        let err = generator(mock, 2)
            .generate(&dataset(), &Metadata::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROBE-011");
    }
}
