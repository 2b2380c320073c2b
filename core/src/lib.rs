pub mod aggregate;
pub mod context;
pub mod db;
pub mod error;
pub mod goals;
pub mod llm;
pub mod models;
pub mod nudge;
pub mod nutrition;
pub mod openai;
pub mod retrieval;
pub mod retry;
pub mod service;
pub mod store;
pub mod timewindow;
pub mod twin;

#[cfg(test)]
mod testing;
