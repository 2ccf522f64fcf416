//! # Arbor
//!
//! An agentic decision-tree orchestration engine for retrieval-augmented
//! generation (RAG) over vector/keyword search backends.
//!
//! ## Architecture
//!
//! Arbor follows a modular, trait-based architecture:
//!
//! - **Core traits** (`core`): capability interfaces for the language
//!   model ([`core::lm::LmClient`]) and the vector store
//!   ([`core::store::StoreConnection`])
//! - **Events** (`events`): the result/text/update taxonomy yielded by
//!   tools and streamed to the frontend
//! - **Tools** (`tools`): the polymorphic tool contract, a declarative
//!   function-to-tool factory and the text-response tools
//! - **Tree** (`tree`): the decision graph, its per-prompt state, the
//!   main loop and persistence
//! - **Agent** (`agent`): the HTTP LM adapter, the chain-of-thought
//!   request builder and few-shot feedback retrieval
//! - **Store** (`store`): the HTTP store client, the shared connection
//!   pool and saved-tree persistence
//! - **Configuration** (`config`): per-tree settings snapshots
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use arbor::config::load_from_env;
//! use arbor::tree::{RunOptions, Tree, TreeOptions};
//! use arbor::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = load_from_env()?;
//!     let mut tree = Tree::new(TreeOptions {
//!         settings: Some(settings),
//!         ..Default::default()
//!     });
//!     let outcome = tree.run("What can you do?", RunOptions::default()).await?;
//!     println!("{}", outcome.text);
//!     Ok(())
//! }
//! ```

// Core abstractions (capability traits and fundamental types)
pub mod core;

// Event taxonomy and frontend wire mapping
pub mod events;

// Agent machinery: LM adapter, chain-of-thought builder, feedback
pub mod agent;

// Per-tree configuration snapshots
pub mod config;

// Store adapters: HTTP client, connection pool, persistence
pub mod store;

// Tools callable from decision nodes
pub mod tools;

// Per-call timing and usage roll-ups
pub mod tracker;

// The decision tree itself
pub mod tree;

// Error types
pub mod error;

#[cfg(test)]
mod test_support;

// Re-export commonly used items (self-prefixed: `core` and `config` would
// otherwise be ambiguous with the extern crates of the same name)
pub use self::config::Settings;
pub use self::core::lm::{LmClient, LmHandle};
pub use self::core::store::StoreConnection;
pub use self::error::{Error, Result};
pub use self::events::{ResultEvent, TextEvent, ToolEvent, UpdateEvent};
pub use self::store::pool::ClientPool;
pub use self::tools::{FnToolBuilder, InputSpec, Tool, ToolContext, ToolSchema};
pub use self::tree::{BranchConfig, BranchInit, RunOptions, RunOutcome, Tree, TreeOptions};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
