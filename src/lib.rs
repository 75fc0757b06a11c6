pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod util;
pub mod web;
