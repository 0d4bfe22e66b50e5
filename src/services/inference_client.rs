//! Typed client for the inference worker. Both operations send a single
//! `user_input` string; image analysis packs its arguments into that string
//! as JSON.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::INFER_DESTINATION;
use crate::coordinator::Dispatcher;
use crate::error::{CoordinatorError, CoordinatorResult};

#[derive(Debug, Clone)]
pub struct InferenceClient {
    dispatcher: Dispatcher,
    destination: String,
    timeout: Option<Duration>,
}

impl InferenceClient {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            destination: INFER_DESTINATION.to_string(),
            timeout: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Override the destination's default timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Analyze a free-text recipe request
    pub async fn analyze_recipe(&self, user_input: &str) -> CoordinatorResult<Value> {
        self.request(json!({ "user_input": user_input })).await
    }

    /// Analyze an uploaded image
    pub async fn analyze_image(&self, s3_url: &str, description: &str) -> CoordinatorResult<Value> {
        self.request(Self::image_request(s3_url, description)?).await
    }

    fn image_request(s3_url: &str, description: &str) -> CoordinatorResult<Value> {
        let image = json!({ "s3_url": s3_url, "description": description });
        let user_input = serde_json::to_string(&image)
            .map_err(|e| CoordinatorError::invalid_payload(e.to_string()))?;
        Ok(json!({ "user_input": user_input }))
    }

    async fn request(&self, payload: Value) -> CoordinatorResult<Value> {
        match self.timeout {
            Some(timeout) => self.dispatcher.call(&self.destination, payload, timeout).await,
            None => {
                self.dispatcher
                    .call_with_default_timeout(&self.destination, payload)
                    .await
            }
        }
    }
}
