// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Telemetry events for multi-step operations.
//!
//! Every rotation emits events to the device-gateway so the fleet backend
//! can follow progress. Event delivery is best effort: a failed POST is
//! logged and never fails the operation.

use async_trait::async_trait;
use serde::Serialize;

use crate::current_target::CurrentTarget;
use crate::http;

/// Event payload, named per the device-gateway API.
#[derive(Debug, Clone, Serialize)]
pub struct DgEvent {
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    pub success: bool,
    #[serde(rename = "targetName")]
    pub target_name: String,
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// Event type discriminator.
#[derive(Debug, Clone, Serialize)]
pub struct DgEventType {
    pub id: String,
    pub version: i32,
}

/// One element of the `POST /events` array.
#[derive(Debug, Clone, Serialize)]
pub struct DgUpdateEvent {
    pub id: String,
    #[serde(rename = "deviceTime")]
    pub device_time: String,
    pub event: DgEvent,
    #[serde(rename = "eventType")]
    pub event_type: DgEventType,
}

/// Sink for operation telemetry.
#[async_trait]
pub trait EventSync: Send + Sync {
    /// Attach the operation's correlation id to subsequent events.
    fn set_correlation_id(&mut self, correlation_id: String);

    /// Emit one event; `error` carries the failure detail when the step
    /// did not succeed.
    async fn notify(&self, event_type: &str, error: Option<&str>);
}

/// Telemetry sink that POSTs to the device-gateway `/events` endpoint.
pub struct DgEventSync {
    client: reqwest::Client,
    url: String,
    correlation_id: String,
    target: CurrentTarget,
}

impl DgEventSync {
    pub fn new(client: reqwest::Client, url: String, target: CurrentTarget) -> Self {
        Self {
            client,
            url,
            correlation_id: String::new(),
            target,
        }
    }
}

#[async_trait]
impl EventSync for DgEventSync {
    fn set_correlation_id(&mut self, correlation_id: String) {
        self.correlation_id = correlation_id;
    }

    async fn notify(&self, event_type: &str, error: Option<&str>) {
        let events = vec![DgUpdateEvent {
            id: uuid::Uuid::new_v4().to_string(),
            device_time: chrono::Utc::now().to_rfc3339(),
            event: DgEvent {
                correlation_id: self.correlation_id.clone(),
                success: error.is_none(),
                target_name: self.target.name.clone(),
                version: self.target.version.to_string(),
                details: error.unwrap_or_default().to_string(),
            },
            event_type: DgEventType {
                id: event_type.to_string(),
                version: 0,
            },
        }];

        match http::post_json(&self.client, &self.url, &events).await {
            Ok(res) if (200..=204).contains(&res.status) => {}
            Ok(res) => tracing::warn!(
                "server could not process event({}): HTTP_{} - {}",
                event_type,
                res.status,
                res.body_str()
            ),
            Err(e) => tracing::warn!("unable to send event: {}", e),
        }
    }
}

/// Telemetry sink that discards everything; used offline and in tests.
#[derive(Default)]
pub struct NoOpEventSync;

#[async_trait]
impl EventSync for NoOpEventSync {
    fn set_correlation_id(&mut self, _correlation_id: String) {}

    async fn notify(&self, _event_type: &str, _error: Option<&str>) {}
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_event_wire_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let target = CurrentTarget {
            name: "lmp-123".to_string(),
            version: 123,
        };
        let mut sync = DgEventSync::new(
            reqwest::Client::new(),
            format!("{}/events", server.uri()),
            target,
        );
        sync.set_correlation_id("certs-1700000000".to_string());
        sync.notify("CertRotationStarted", None).await;
        sync.notify("est", Some("boom")).await;

        let reqs = server.received_requests().await.unwrap();
        assert_eq!(reqs.len(), 2);

        let body: serde_json::Value = serde_json::from_slice(&reqs[0].body).unwrap();
        let evt = &body[0];
        assert_eq!(evt["event"]["correlationId"], "certs-1700000000");
        assert_eq!(evt["event"]["success"], true);
        assert_eq!(evt["event"]["targetName"], "lmp-123");
        assert_eq!(evt["event"]["version"], "123");
        assert_eq!(evt["eventType"]["id"], "CertRotationStarted");
        assert_eq!(evt["eventType"]["version"], 0);
        assert!(evt["event"].get("details").is_none());
        assert!(evt["id"].as_str().unwrap().len() >= 32);
        assert!(evt["deviceTime"].as_str().is_some());

        let body: serde_json::Value = serde_json::from_slice(&reqs[1].body).unwrap();
        assert_eq!(body[0]["event"]["success"], false);
        assert_eq!(body[0]["event"]["details"], "boom");
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
            .mount(&server)
            .await;

        let mut sync = DgEventSync::new(
            reqwest::Client::new(),
            format!("{}/events", server.uri()),
            CurrentTarget::default(),
        );
        sync.set_correlation_id("certs-1".to_string());
        // Must not panic or surface an error
        sync.notify("CertRotationStarted", None).await;
    }
}
