pub mod crawl_client;
pub mod inference_client;

pub use crawl_client::{CrawlClient, QueuedTask};
pub use inference_client::InferenceClient;
