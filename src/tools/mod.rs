//! Tools callable from decision nodes.

mod function;
mod text;
mod traits;

pub use function::{FnTool, FnToolBuilder};
pub use text::{ForcedTextResponse, TextResponse, FORCED_TEXT_RESPONSE, TEXT_RESPONSE};
pub use traits::{InputSpec, Tool, ToolContext, ToolEventStream, ToolInputs, ToolSchema};
