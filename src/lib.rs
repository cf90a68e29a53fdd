pub mod analyzer;
pub mod connectors;
pub mod coverage;
pub mod crypto;
pub mod db;
pub mod mcp;
pub mod output;
pub mod pipeline;
