//! HTTP store client.
//!
//! REST adapter for a Weaviate-style vector store: schema and object
//! endpoints for CRUD, the GraphQL endpoint for semantic search and
//! aggregation. Authentication failures surface as `StoreAuth`; query
//! misuse (bad filters, semantic search on a non-vectorised collection)
//! surfaces as `StoreQuery`. Both are recoverable from the tree's
//! perspective.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::config::Settings;
use crate::core::store::{
    AggregateRequest, AggregateResult, Filter, NearTextQuery, StoreConnection, StoredObject,
};
use crate::error::{Error, Result};
use crate::events::JsonObject;

use super::pool::ConnectionFactory;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRY_ELAPSED: Duration = Duration::from_secs(15);

/// Store headers carrying third-party model-provider keys, derived from
/// the `*_apikey` options.
fn provider_header(option: &str) -> Option<&'static str> {
    let provider = option
        .strip_suffix("_apikey")
        .or_else(|| option.strip_suffix("_api_key"))?;
    match provider {
        "openai" => Some("X-OpenAI-Api-Key"),
        "anthropic" => Some("X-Anthropic-Api-Key"),
        "cohere" => Some("X-Cohere-Api-Key"),
        "huggingface" => Some("X-HuggingFace-Api-Key"),
        "jinaai" => Some("X-JinaAI-Api-Key"),
        "mistral" => Some("X-Mistral-Api-Key"),
        "voyage" => Some("X-Voyage-Api-Key"),
        "azure" => Some("X-Azure-Api-Key"),
        "nvidia" => Some("X-Nvidia-Api-Key"),
        "xai" => Some("X-Xai-Api-Key"),
        "anyscale" => Some("X-Anyscale-Api-Key"),
        "vertex" => Some("X-Goog-Vertex-Api-Key"),
        "studio" => Some("X-Goog-Studio-Api-Key"),
        _ => None,
    }
}

/// REST client for one store endpoint.
pub struct HttpStoreClient {
    base: Url,
    client: reqwest::Client,
}

impl HttpStoreClient {
    pub fn new(
        url: &str,
        api_key: &SecretString,
        provider_keys: &[(String, String)],
    ) -> Result<Self> {
        let base = Url::parse(url)?;

        let mut headers = HeaderMap::new();
        if !api_key.expose_secret().is_empty() {
            let value = format!("Bearer {}", api_key.expose_secret());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value)
                    .map_err(|_| Error::Config("Store API key contains invalid bytes".into()))?,
            );
        }
        for (option, secret) in provider_keys {
            if let Some(header) = provider_header(option) {
                let name: HeaderName = header
                    .parse()
                    .map_err(|_| Error::Internal(format!("Invalid header name '{}'", header)))?;
                headers.insert(
                    name,
                    HeaderValue::from_str(secret).map_err(|_| {
                        Error::Config(format!("API key '{}' contains invalid bytes", option))
                    })?,
                );
            }
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(HttpStoreClient { base, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base.as_str().trim_end_matches('/'), path)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let detail = response.text().await.unwrap_or_default();
                Err(Error::StoreAuth(format!("{}: {}", status, detail)))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let detail = response.text().await.unwrap_or_default();
                Err(Error::StoreQuery(format!("{}: {}", status, detail)))
            }
            s if !s.is_success() && s != StatusCode::NOT_FOUND => {
                let detail = response.text().await.unwrap_or_default();
                Err(Error::Store(format!("{}: {}", status, detail)))
            }
            _ => Ok(response),
        }
    }

    async fn graphql(&self, query: String) -> Result<Value> {
        let response = self
            .client
            .post(self.endpoint("/v1/graphql"))
            .json(&json!({ "query": query }))
            .send()
            .await?;
        let body: Value = self.check(response).await?.json().await?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string()
                    })
                    .collect();
                return Err(Error::StoreQuery(messages.join("; ")));
            }
        }
        Ok(body)
    }
}

fn render_where(filter: &Filter) -> String {
    match filter {
        Filter::Equal { property, value } => format!(
            "{{path: [{}], operator: Equal, {}}}",
            quote(property),
            render_value_arg(value)
        ),
        Filter::ContainsAny { property, values } => {
            let rendered: Vec<String> = values.iter().map(render_bare_value).collect();
            let key = values
                .first()
                .map(value_key)
                .unwrap_or("valueText");
            format!(
                "{{path: [{}], operator: ContainsAny, {}: [{}]}}",
                quote(property),
                key,
                rendered.join(", ")
            )
        }
        Filter::AllOf { filters } => {
            let operands: Vec<String> = filters.iter().map(render_where).collect();
            format!("{{operator: And, operands: [{}]}}", operands.join(", "))
        }
    }
}

fn value_key(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "valueBoolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "valueInt",
        Value::Number(_) => "valueNumber",
        _ => "valueText",
    }
}

fn render_value_arg(value: &Value) -> String {
    format!("{}: {}", value_key(value), render_bare_value(value))
}

fn render_bare_value(value: &Value) -> String {
    match value {
        Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

#[async_trait]
impl StoreConnection for HttpStoreClient {
    async fn ready(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint("/v1/.well-known/ready"))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.endpoint(&format!("/v1/schema/{}", name)))
            .send()
            .await?;
        let response = self.check(response).await?;
        Ok(response.status() != StatusCode::NOT_FOUND)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let response = self.client.get(self.endpoint("/v1/schema")).send().await?;
        let body: Value = self.check(response).await?.json().await?;
        let classes = body
            .get("classes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(classes
            .into_iter()
            .filter_map(|c| c.get("class").and_then(Value::as_str).map(str::to_string))
            .filter(|name| !name.starts_with("ARBOR_"))
            .collect())
    }

    async fn create_collection(&self, name: &str, properties: &[&str]) -> Result<()> {
        let body = json!({
            "class": name,
            "vectorizer": "none",
            "properties": properties
                .iter()
                .map(|p| json!({ "name": p, "dataType": ["text"] }))
                .collect::<Vec<_>>(),
        });
        let response = self
            .client
            .post(self.endpoint("/v1/schema"))
            .json(&body)
            .send()
            .await?;
        self.check(response).await?;
        debug!(collection = name, "Created collection");
        Ok(())
    }

    async fn fetch_objects(&self, collection: &str, limit: usize) -> Result<Vec<StoredObject>> {
        // The store rejects absurd page sizes; callers asking for
        // "everything" get the protocol maximum.
        let limit = limit.min(10_000);
        let response = self
            .client
            .get(self.endpoint(&format!("/v1/objects?class={}&limit={}", collection, limit)))
            .send()
            .await?;
        let body: Value = self.check(response).await?.json().await?;
        let objects = body
            .get("objects")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(objects
            .into_iter()
            .filter_map(|obj| {
                Some(StoredObject {
                    uuid: obj.get("id")?.as_str()?.to_string(),
                    properties: obj
                        .get("properties")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn fetch_object(&self, collection: &str, id: &str) -> Result<Option<StoredObject>> {
        let response = self
            .client
            .get(self.endpoint(&format!("/v1/objects/{}/{}", collection, id)))
            .send()
            .await?;
        let response = self.check(response).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = response.json().await?;
        Ok(Some(StoredObject {
            uuid: id.to_string(),
            properties: body
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }))
    }

    async fn insert(&self, collection: &str, id: &str, properties: &JsonObject) -> Result<()> {
        let body = json!({
            "class": collection,
            "id": id,
            "properties": properties,
        });
        let response = self
            .client
            .post(self.endpoint("/v1/objects"))
            .json(&body)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, properties: &JsonObject) -> Result<()> {
        let body = json!({
            "class": collection,
            "id": id,
            "properties": properties,
        });
        let response = self
            .client
            .put(self.endpoint(&format!("/v1/objects/{}/{}", collection, id)))
            .json(&body)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&format!("/v1/objects/{}/{}", collection, id)))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn add_reference(
        &self,
        collection: &str,
        from_id: &str,
        property: &str,
        to_collection: &str,
        to_id: &str,
    ) -> Result<()> {
        let body = json!({
            "beacon": format!("weaviate://localhost/{}/{}", to_collection, to_id),
        });
        let response = self
            .client
            .post(self.endpoint(&format!(
                "/v1/objects/{}/{}/references/{}",
                collection, from_id, property
            )))
            .json(&body)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn near_text(&self, query: &NearTextQuery) -> Result<Vec<StoredObject>> {
        let mut args = vec![format!("limit: {}", query.limit)];
        let mut near = format!("nearText: {{concepts: [{}]", quote(&query.query));
        if let Some(certainty) = query.certainty {
            near.push_str(&format!(", certainty: {}", certainty));
        }
        near.push('}');
        args.push(near);
        if let Some(filter) = &query.filters {
            args.push(format!("where: {}", render_where(filter)));
        }

        let gql = format!(
            "{{ Get {{ {}({}) {{ _additional {{ id }} }} }} }}",
            query.collection,
            args.join(", ")
        );
        let body = self.graphql(gql).await?;

        let hits = body
            .pointer(&format!("/data/Get/{}", query.collection))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut objects = Vec::new();
        for hit in hits {
            let Some(id) = hit.pointer("/_additional/id").and_then(Value::as_str) else {
                continue;
            };
            if let Some(object) = self.fetch_object(&query.collection, id).await? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateResult> {
        let mut args = Vec::new();
        if let Some(group_by) = &request.group_by {
            args.push(format!("groupBy: [{}]", quote(group_by)));
        }
        if let Some(filter) = &request.filters {
            args.push(format!("where: {}", render_where(filter)));
        }
        let arg_str = if args.is_empty() {
            String::new()
        } else {
            format!("({})", args.join(", "))
        };
        let fields = if request.group_by.is_some() {
            "groupedBy { value } meta { count }"
        } else {
            "meta { count }"
        };
        let gql = format!(
            "{{ Aggregate {{ {}{} {{ {} }} }} }}",
            request.collection, arg_str, fields
        );
        let body = self.graphql(gql).await?;

        let rows = body
            .pointer(&format!("/data/Aggregate/{}", request.collection))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = AggregateResult::default();
        for row in rows {
            let count = row
                .pointer("/meta/count")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            result.total_count += count;
            if request.group_by.is_some() {
                let mut group = Map::new();
                if let Some(value) = row.pointer("/groupedBy/value") {
                    group.insert("value".into(), value.clone());
                }
                group.insert("count".into(), json!(count));
                result.groups.push(group);
            }
        }
        Ok(result)
    }
}

/// Builds [`HttpStoreClient`] connections for the pool, retrying
/// transient failures and failing fast on bad credentials.
pub struct HttpStoreFactory {
    url: String,
    api_key: SecretString,
    provider_keys: Vec<(String, String)>,
}

impl HttpStoreFactory {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Url::parse(&settings.store_url)?;
        let provider_keys = settings
            .api_keys
            .iter()
            .map(|(name, secret)| (name.clone(), secret.expose_secret().to_string()))
            .collect();
        Ok(HttpStoreFactory {
            url: settings.store_url.clone(),
            api_key: settings.store_api_key.clone(),
            provider_keys,
        })
    }
}

#[async_trait]
impl ConnectionFactory for HttpStoreFactory {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(CONNECT_RETRY_ELAPSED))
            .build();

        let client = backoff::future::retry(backoff, || async {
            let client = HttpStoreClient::new(&self.url, &self.api_key, &self.provider_keys)
                .map_err(backoff::Error::permanent)?;
            match client.ready().await {
                Ok(()) => Ok(client),
                Err(err @ Error::StoreAuth(_)) => Err(backoff::Error::permanent(err)),
                Err(err) => {
                    warn!("Store not ready, retrying: {}", err);
                    Err(backoff::Error::transient(err))
                }
            }
        })
        .await?;

        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpStoreClient {
        HttpStoreClient::new(
            &server.uri(),
            &SecretString::from("key".to_string()),
            &[("openai_apikey".to_string(), "sk-test".to_string())],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ready_auth_failure_maps_to_store_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/.well-known/ready"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        assert!(matches!(
            client(&server).ready().await,
            Err(Error::StoreAuth(_))
        ));
    }

    #[tokio::test]
    async fn test_collection_exists_distinguishes_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/schema/Present"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"class": "Present"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/schema/Absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(client.collection_exists("Present").await.unwrap());
        assert!(!client.collection_exists("Absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_near_text_resolves_ids_to_objects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"Get": {"Docs": [{"_additional": {"id": "abc"}}]}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v1/objects/Docs/abc$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc",
                "properties": {"title": "hello"}
            })))
            .mount(&server)
            .await;

        let objects = client(&server)
            .near_text(&NearTextQuery {
                collection: "Docs".into(),
                query: "greetings".into(),
                limit: 5,
                certainty: Some(0.7),
                filters: None,
            })
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].properties["title"], json!("hello"));
    }

    #[tokio::test]
    async fn test_graphql_errors_map_to_store_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{"message": "no vectorizer configured for class Docs"}]
            })))
            .mount(&server)
            .await;

        let result = client(&server)
            .near_text(&NearTextQuery {
                collection: "Docs".into(),
                query: "x".into(),
                limit: 1,
                certainty: None,
                filters: None,
            })
            .await;
        match result {
            Err(Error::StoreQuery(message)) => assert!(message.contains("vectorizer")),
            other => panic!("expected StoreQuery, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_aggregate_counts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"Aggregate": {"Docs": [{"meta": {"count": 42}}]}}
            })))
            .mount(&server)
            .await;

        let result = client(&server)
            .aggregate(&AggregateRequest {
                collection: "Docs".into(),
                group_by: None,
                filters: None,
            })
            .await
            .unwrap();
        assert_eq!(result.total_count, 42);
    }

    #[test]
    fn test_render_where_nested() {
        let filter = Filter::AllOf {
            filters: vec![
                Filter::Equal {
                    property: "feedback".into(),
                    value: json!(2.0),
                },
                Filter::ContainsAny {
                    property: "modules_used".into(),
                    values: vec![json!("decision")],
                },
            ],
        };
        let rendered = render_where(&filter);
        assert!(rendered.contains("operator: And"));
        assert!(rendered.contains("valueNumber: 2.0"));
        assert!(rendered.contains("ContainsAny"));
    }

    #[test]
    fn test_provider_header_mapping() {
        assert_eq!(provider_header("openai_apikey"), Some("X-OpenAI-Api-Key"));
        assert_eq!(provider_header("cohere_api_key"), Some("X-Cohere-Api-Key"));
        assert_eq!(provider_header("unknown_apikey"), None);
        assert_eq!(provider_header("not_a_key"), None);
    }
}
