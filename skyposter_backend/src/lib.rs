pub mod agent;
pub mod config;
pub mod content;
pub mod dedup;
pub mod error;
pub mod http_client;
pub mod llm_client;
pub mod news;
pub mod planner;
pub mod posting;
pub mod rate_limit;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod social;
pub mod stats;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;
