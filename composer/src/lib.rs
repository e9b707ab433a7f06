//! A streaming parser and executor for server-side fragment composition:
//! a template is read once, `<fragment>` placeholders are fetched
//! concurrently from upstream services, and the result is streamed back to
//! the client in template order without buffering the whole response.

mod assembler;
mod config;
mod coordinator;
mod descriptor;
mod error;
mod fetch;
mod parse;
mod runtime;
mod sentinel;

pub use crate::assembler::ContextMap;
pub use crate::config::Configuration;
pub use crate::coordinator::{ComposedResponse, Composer};
pub use crate::error::{CompositionError, Result};
pub use crate::parse::{parse_template, RawFragmentAttrs, TemplateEvent};

// Re-export so callers building `ContextMap`/`client_headers` don't need a
// direct dependency on these crates just to match our types.
pub use reqwest::header::HeaderMap;
