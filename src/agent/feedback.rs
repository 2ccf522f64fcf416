//! Few-shot feedback retrieval.
//!
//! When `use_feedback` is enabled, decisions are primed with examples of
//! well-rated past runs. Super-positive examples (feedback = 2) are
//! fetched first by semantic similarity to the current prompt, topped up
//! with positive ones (feedback = 1) when fewer than `n` are found.

use serde_json::Value;

use crate::core::lm::FewShotExample;
use crate::core::store::{Filter, NearTextQuery, StoreConnection};
use crate::error::Result;
use crate::events::TrainingUpdate;

/// Collection holding rated run records.
pub const FEEDBACK_COLLECTION: &str = "ARBOR_FEEDBACK__";

const SIMILARITY_CERTAINTY: f64 = 0.7;

fn feedback_filter(module: &str, rating: f64) -> Filter {
    Filter::AllOf {
        filters: vec![
            Filter::ContainsAny {
                property: "modules_used".into(),
                values: vec![Value::String(module.to_string())],
            },
            Filter::Equal {
                property: "feedback".into(),
                value: serde_json::json!(rating),
            },
        ],
    }
}

/// Fetch up to `n` few-shot examples for `module`, most similar to
/// `user_prompt`, with the UUIDs of the backing feedback records.
pub async fn fetch_similar(
    conn: &dyn StoreConnection,
    user_prompt: &str,
    module: &str,
    n: usize,
) -> Result<(Vec<FewShotExample>, Vec<String>)> {
    if !conn.collection_exists(FEEDBACK_COLLECTION).await? {
        return Ok((Vec::new(), Vec::new()));
    }

    let query = |rating: f64| NearTextQuery {
        collection: FEEDBACK_COLLECTION.into(),
        query: user_prompt.to_string(),
        limit: n,
        certainty: Some(SIMILARITY_CERTAINTY),
        filters: Some(feedback_filter(module, rating)),
    };

    let mut records = conn.near_text(&query(2.0)).await?;
    if records.len() < n {
        let top_up = conn.near_text(&query(1.0)).await?;
        let missing = n - records.len();
        records.extend(top_up.into_iter().take(missing));
    }

    let mut examples = Vec::new();
    let mut uuids = Vec::new();
    for record in records {
        let updates = parse_training_updates(record.properties.get("training_updates"));
        for update in updates {
            if update.module_name == module {
                examples.push(FewShotExample {
                    inputs: update.inputs,
                    outputs: update.outputs,
                });
            }
        }
        uuids.push(record.uuid);
    }
    examples.truncate(n);

    Ok((examples, uuids))
}

fn parse_training_updates(value: Option<&Value>) -> Vec<TrainingUpdate> {
    let value = match value {
        Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded).ok(),
        Some(other) => Some(other.clone()),
        None => None,
    };
    match value {
        Some(value) => serde_json::from_value(value).unwrap_or_default(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use serde_json::json;

    fn feedback_record(rating: f64, module: &str, reasoning: &str) -> Value {
        json!({
            "user_prompt": "What products do we have?",
            "modules_used": [module],
            "feedback": rating,
            "training_updates": [{
                "module_name": module,
                "inputs": {"user_prompt": "What products do we have?"},
                "outputs": {"reasoning": reasoning, "function_name": "query"},
            }],
        })
    }

    #[tokio::test]
    async fn test_missing_collection_returns_empty() {
        let store = MemoryStore::new();
        let (examples, uuids) = fetch_similar(&store, "anything", "decision", 3)
            .await
            .unwrap();
        assert!(examples.is_empty());
        assert!(uuids.is_empty());
    }

    #[tokio::test]
    async fn test_superpositive_examples_come_first() {
        let store = MemoryStore::new();
        store.create_raw_collection(FEEDBACK_COLLECTION);
        store.insert_raw(
            FEEDBACK_COLLECTION,
            "a",
            feedback_record(2.0, "decision", "great"),
        );
        store.insert_raw(
            FEEDBACK_COLLECTION,
            "b",
            feedback_record(1.0, "decision", "fine"),
        );

        let (examples, uuids) = fetch_similar(&store, "products", "decision", 2)
            .await
            .unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(uuids.len(), 2);
        assert_eq!(uuids[0], "a");
        assert_eq!(examples[0].outputs["reasoning"], json!("great"));
    }

    #[tokio::test]
    async fn test_other_modules_are_filtered_out() {
        let store = MemoryStore::new();
        store.create_raw_collection(FEEDBACK_COLLECTION);
        store.insert_raw(
            FEEDBACK_COLLECTION,
            "a",
            feedback_record(2.0, "summarise", "irrelevant"),
        );

        let (examples, _) = fetch_similar(&store, "products", "decision", 3)
            .await
            .unwrap();
        assert!(examples.is_empty());
    }

    #[test]
    fn test_parse_training_updates_accepts_encoded_strings() {
        let encoded = json!("[{\"module_name\": \"decision\", \"inputs\": {}, \"outputs\": {}}]");
        let updates = parse_training_updates(Some(&encoded));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].module_name, "decision");
    }
}
