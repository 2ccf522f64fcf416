//! Store adapters: the HTTP client, the shared connection pool and
//! saved-tree persistence.

pub mod http;
pub mod persist;
pub mod pool;

pub use http::{HttpStoreClient, HttpStoreFactory};
pub use persist::{
    delete_saved_tree, list_saved_trees, load_tree, save_tree, tree_object_id, SavedTreeInfo,
};
pub use pool::{ClientPool, ConnectionFactory, StoreLease, DRAIN_TIMEOUT};
