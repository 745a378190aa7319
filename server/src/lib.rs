pub mod app;
pub mod bot;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handoff;
pub mod llm;
pub mod pipeline;
pub mod prompting;
pub mod registry;
pub mod router;
pub mod translate;
pub mod types;
pub mod typing;
