//! HTTP webhook sink (cloud connector, rules engine)

use async_trait::async_trait;
use std::time::Duration;

use super::{PublishEvent, PublishSink, SinkError};

/// POSTs each accepted event as JSON to a fixed URL.
pub struct WebhookSink {
    name: String,
    url: String,
    http: reqwest::Client,
    /// Only forward events that carry presence changes
    changes_only: bool,
}

impl WebhookSink {
    pub fn new(name: &str, url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            http,
            changes_only: false,
        })
    }

    /// Sink for the cloud connector: receives every event.
    pub fn cloud_connector(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        Self::new("cloud-connector", url, timeout)
    }

    /// Sink for the rules engine: only state changes are of interest.
    pub fn rules_engine(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let mut sink = Self::new("rules-engine", url, timeout)?;
        sink.changes_only = true;
        Ok(sink)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PublishSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, event: &PublishEvent) -> bool {
        !self.changes_only || !event.changes().is_empty()
    }

    async fn publish(&self, event: &PublishEvent) -> Result<(), SinkError> {
        let resp = self
            .http
            .post(&self.url)
            .header("X-Event-Kind", event.kind())
            .json(event)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::ChangeBatch;

    fn batch(with_changes: bool) -> PublishEvent {
        use crate::types::{Tag, TagRead, TagState, TagStateChange};
        let mut tag = Tag::first_sighting(&TagRead::new("AA", -50, 1_000, "floor-1", "F1"));
        tag.state = TagState::Present;
        let changes = if with_changes {
            TagStateChange::between(None, &tag).into_iter().collect()
        } else {
            Vec::new()
        };
        PublishEvent::StateChanges(ChangeBatch {
            id: "e1".into(),
            sent_on: 1,
            source: None,
            controller_id: None,
            facility_scope: Vec::new(),
            tags: vec![tag],
            changes,
        })
    }

    #[test]
    fn test_rules_engine_only_takes_changes() {
        let rules = WebhookSink::rules_engine("http://localhost:9/rules", Duration::from_secs(1)).unwrap();
        assert!(rules.accepts(&batch(true)));
        assert!(!rules.accepts(&batch(false)));
        assert!(!rules.accepts(&PublishEvent::tags_deleted(1)));

        let cloud = WebhookSink::cloud_connector("http://localhost:9/cloud/", Duration::from_secs(1)).unwrap();
        assert!(cloud.accepts(&batch(false)));
        assert!(cloud.accepts(&PublishEvent::tags_deleted(1)));
        assert_eq!(cloud.url(), "http://localhost:9/cloud");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_sink_error() {
        // Port 9 (discard) is not listening on test hosts
        let sink = WebhookSink::cloud_connector("http://127.0.0.1:9/", Duration::from_secs(2)).unwrap();
        assert!(sink.publish(&batch(true)).await.is_err());
    }
}
