// intervene-core: retrieval and structured-generation glue shared by the
// intervene server and CLI.

pub mod types;
pub mod config;
pub mod upstream;
pub mod selector;
pub mod mirror;
pub mod embedding;
pub mod vector;
pub mod llm;
pub mod events;
pub mod openapi;
pub mod run;

// Test utilities - always available for use by intervene-server and tests
pub mod testutil;

#[cfg(test)]
pub(crate) mod fake_http;
