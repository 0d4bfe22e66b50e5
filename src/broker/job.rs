//! # Publish Jobs
//!
//! Units of outbound work handed from callers to the IoLoop. A job is
//! immutable once enqueued and owned by the IoLoop from then on.

use crate::messaging::PublishProperties;

/// Where the reply to a synchronous request should be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyHint {
    /// Worker replies on this shared response queue with the correlation id in the body
    SharedQueue(String),
    /// Worker replies on the connection's callback queue, resolved at publish time
    CallbackQueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishJob {
    FireAndForget {
        destination: String,
        routing_key: String,
        correlation_id: String,
        body: Vec<u8>,
    },
    SynchronousRequest {
        destination: String,
        routing_key: String,
        correlation_id: String,
        body: Vec<u8>,
        reply_hint: ReplyHint,
    },
}

impl PublishJob {
    pub fn destination(&self) -> &str {
        match self {
            Self::FireAndForget { destination, .. } | Self::SynchronousRequest { destination, .. } => {
                destination
            }
        }
    }

    pub fn routing_key(&self) -> &str {
        match self {
            Self::FireAndForget { routing_key, .. } | Self::SynchronousRequest { routing_key, .. } => {
                routing_key
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::FireAndForget { correlation_id, .. }
            | Self::SynchronousRequest { correlation_id, .. } => correlation_id,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            Self::FireAndForget { body, .. } | Self::SynchronousRequest { body, .. } => body,
        }
    }

    pub fn is_synchronous(&self) -> bool {
        matches!(self, Self::SynchronousRequest { .. })
    }

    /// Message properties for this job. `callback_queue` is the connection's
    /// current callback queue, used when the reply hint asks for it.
    pub fn properties(&self, callback_queue: Option<&str>) -> PublishProperties {
        let properties =
            PublishProperties::persistent_json().with_correlation_id(self.correlation_id());
        match self {
            Self::SynchronousRequest {
                reply_hint: ReplyHint::CallbackQueue,
                ..
            } => match callback_queue {
                Some(queue) => properties.with_reply_to(queue),
                None => properties,
            },
            Self::SynchronousRequest {
                reply_hint: ReplyHint::SharedQueue(queue),
                ..
            } => properties.with_reply_to(queue.as_str()),
            Self::FireAndForget { .. } => properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_job(reply_hint: ReplyHint) -> PublishJob {
        PublishJob::SynchronousRequest {
            destination: "infer".to_string(),
            routing_key: "recipe_analysis_request".to_string(),
            correlation_id: "c-1".to_string(),
            body: b"{}".to_vec(),
            reply_hint,
        }
    }

    #[test]
    fn test_callback_reply_to_resolved_at_publish_time() {
        let job = sync_job(ReplyHint::CallbackQueue);
        let props = job.properties(Some("amq.gen-3"));
        assert_eq!(props.reply_to.as_deref(), Some("amq.gen-3"));
        assert_eq!(props.correlation_id.as_deref(), Some("c-1"));
        assert!(job.is_synchronous());
    }

    #[test]
    fn test_shared_queue_reply_to() {
        let job = sync_job(ReplyHint::SharedQueue("crawling_response".to_string()));
        let props = job.properties(Some("amq.gen-3"));
        assert_eq!(props.reply_to.as_deref(), Some("crawling_response"));
    }

    #[test]
    fn test_fire_and_forget_has_no_reply_to() {
        let job = PublishJob::FireAndForget {
            destination: "crawl".to_string(),
            routing_key: "crawling_request".to_string(),
            correlation_id: "c-2".to_string(),
            body: b"{}".to_vec(),
        };
        let props = job.properties(Some("amq.gen-3"));
        assert_eq!(props.reply_to, None);
        assert_eq!(job.routing_key(), "crawling_request");
        assert_eq!(job.destination(), "crawl");
    }
}
