//! Inbox Flow: durable triage workflow for incoming mail.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod retrieval;
pub mod retry;
pub mod scoring;
pub mod server;
pub mod store;
pub mod workflow;
