pub mod admin;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod generator;
pub mod indexer;
pub mod models;
pub mod pipeline;
pub mod rag;
pub mod retry;

#[cfg(test)]
mod testing;
