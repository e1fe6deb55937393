//! HTTP surface for the batch inference job server: an OpenAI-compatible
//! subset of the Files and Batches APIs, a models listing, and health
//! endpoints, all backed by `batch-core`.

pub mod api;
pub mod auth;
pub mod error;
pub mod state;

pub use api::create_router;
pub use state::AppState;
