//! Saved-tree persistence.
//!
//! Trees serialise to a single JSON blob stored in a collection with the
//! schema `{user_id, conversation_id, tree, title}`. Object ids are
//! derived from the conversation id (v5 UUID), so saving twice updates
//! in place.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::store::StoreConnection;
use crate::error::{Error, Result};

/// Properties of the saved-tree collection.
pub const SAVED_TREE_PROPERTIES: [&str; 4] = ["user_id", "conversation_id", "tree", "title"];

/// Stable object id for a conversation's saved tree.
pub fn tree_object_id(conversation_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, conversation_id.as_bytes()).to_string()
}

/// Listing entry for one saved tree.
#[derive(Debug, Clone)]
pub struct SavedTreeInfo {
    pub title: String,
}

/// Insert or update a tree blob under its conversation id, creating the
/// collection on first use.
pub async fn save_tree(
    conn: &dyn StoreConnection,
    collection: &str,
    user_id: &str,
    conversation_id: &str,
    title: Option<&str>,
    tree_json: &Value,
) -> Result<()> {
    if !conn.collection_exists(collection).await? {
        conn.create_collection(collection, &SAVED_TREE_PROPERTIES)
            .await?;
    }

    let mut properties = Map::new();
    properties.insert("user_id".into(), Value::String(user_id.to_string()));
    properties.insert(
        "conversation_id".into(),
        Value::String(conversation_id.to_string()),
    );
    properties.insert("tree".into(), Value::String(tree_json.to_string()));
    properties.insert(
        "title".into(),
        Value::String(title.unwrap_or_default().to_string()),
    );

    let id = tree_object_id(conversation_id);
    if conn.fetch_object(collection, &id).await?.is_some() {
        conn.update(collection, &id, &properties).await
    } else {
        conn.insert(collection, &id, &properties).await
    }
}

/// Load a tree blob by conversation id.
pub async fn load_tree(
    conn: &dyn StoreConnection,
    collection: &str,
    conversation_id: &str,
) -> Result<Value> {
    if !conn.collection_exists(collection).await? {
        return Err(Error::NotFound(format!(
            "Collection '{}' does not exist in this store",
            collection
        )));
    }
    let id = tree_object_id(conversation_id);
    let object = conn
        .fetch_object(collection, &id)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "No tree found for conversation id '{}' in collection '{}'",
                conversation_id, collection
            ))
        })?;
    let encoded = object
        .properties
        .get("tree")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Store("Saved tree object is missing its 'tree' property".into()))?;
    Ok(serde_json::from_str(encoded)?)
}

/// All saved trees in a collection, optionally filtered by user, keyed by
/// conversation id.
pub async fn list_saved_trees(
    conn: &dyn StoreConnection,
    collection: &str,
    user_id: Option<&str>,
) -> Result<BTreeMap<String, SavedTreeInfo>> {
    if !conn.collection_exists(collection).await? {
        return Ok(BTreeMap::new());
    }
    let objects = conn.fetch_objects(collection, usize::MAX).await?;
    let mut trees = BTreeMap::new();
    for object in objects {
        if let Some(wanted) = user_id {
            let owner = object
                .properties
                .get("user_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if owner != wanted {
                continue;
            }
        }
        let Some(conversation_id) = object
            .properties
            .get("conversation_id")
            .and_then(Value::as_str)
        else {
            continue;
        };
        let title = object
            .properties
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        trees.insert(conversation_id.to_string(), SavedTreeInfo { title });
    }
    Ok(trees)
}

/// Delete a saved tree by conversation id, if present.
pub async fn delete_saved_tree(
    conn: &dyn StoreConnection,
    collection: &str,
    conversation_id: &str,
) -> Result<()> {
    let id = tree_object_id(conversation_id);
    if conn.fetch_object(collection, &id).await?.is_some() {
        conn.delete(collection, &id).await?;
    }
    Ok(())
}
