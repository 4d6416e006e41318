pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod extract;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod queue;
pub mod records;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod store;

pub use pipeline::{DocumentPipeline, TaskContext, TaskOutcome, TaskRequest, MAX_RETRY_COUNT};
pub use state::AppState;
