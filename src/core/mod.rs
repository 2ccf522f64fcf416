//! Core abstractions (traits and fundamental types)
//!
//! The engine treats its collaborators as capabilities:
//! - [`lm::LmClient`]: an opaque structured-completion endpoint.
//! - [`store::StoreConnection`]: a vector/keyword store.
//!
//! Concrete adapters live in `agent::client` and `store::http`.

pub mod lm;
pub mod store;

pub use lm::{
    CompletionRequest, FewShotExample, FieldKind, InputField, LmClient, LmHandle, LmUsage,
    OutputField, StructuredOutput,
};
pub use store::{
    fetch_collection_metadata, AggregateRequest, AggregateResult, CollectionMetadata, Filter,
    MetadataLookup, NearTextQuery, StoreConnection, StoredObject, METADATA_COLLECTION_PREFIX,
    METADATA_COLLECTION_SUFFIX,
};
