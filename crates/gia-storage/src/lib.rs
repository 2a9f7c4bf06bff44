//! Persistence and shared HTTP plumbing for the aggregation pipeline.

mod http;
mod postgres;
mod store;

pub use http::{
    classify_reqwest_error, classify_status, retry_with_fixed_delay, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition, RetryPolicy,
};
pub use postgres::PgStore;
pub use store::{ImageStore, JobStore, MemoryStore, StoreError};

pub const CRATE_NAME: &str = "gia-storage";
