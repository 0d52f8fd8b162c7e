/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Delivery of a task to one agent.

use std::time::Duration;

use agora_runtime::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::model::Task;

/// Sent to the agent on delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchPayload {
    pub task_id: String,
    pub capability: String,
    pub priority: u8,
    pub input: Value,
    pub timeout_seconds: u64,
    pub retry_count: u32,
}

impl From<&Task> for DispatchPayload {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            capability: task.capability_required.clone(),
            priority: task.priority,
            input: task.input.clone(),
            timeout_seconds: task.timeout_seconds,
            retry_count: task.retry_count,
        }
    }
}

/// The agent's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentReply {
    pub fn into_result(self) -> Result<Value, DispatchError> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(DispatchError::Failed(
                self.error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            ))
        }
    }
}

/// "Deliver this payload to this agent, return success/failure/timeout."
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn deliver(
        &self,
        agent_id: &str,
        payload: &DispatchPayload,
    ) -> Result<Value, DispatchError>;
}

/// Request/reply over NATS on `{prefix}.{env}.agent.{agent_id}.task`.
pub struct NatsTransport {
    client: async_nats::Client,
    subject_prefix: String,
    env: String,
}

impl NatsTransport {
    #[must_use]
    pub fn new(client: async_nats::Client, subject_prefix: &str, env: &str) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.to_string(),
            env: env.to_string(),
        }
    }

    #[must_use]
    pub fn subject_for(&self, agent_id: &str) -> String {
        format!("{}.{}.agent.{agent_id}.task", self.subject_prefix, self.env)
    }
}

#[async_trait]
impl AgentTransport for NatsTransport {
    async fn deliver(
        &self,
        agent_id: &str,
        payload: &DispatchPayload,
    ) -> Result<Value, DispatchError> {
        let subject = self.subject_for(agent_id);
        let bytes =
            serde_json::to_vec(payload).map_err(|e| DispatchError::Failed(e.to_string()))?;
        let request = async_nats::Request::new()
            .payload(bytes.into())
            .timeout(Some(Duration::from_secs(payload.timeout_seconds)));

        debug!(subject = %subject, task_id = %payload.task_id, "delivering task");
        let message = self
            .client
            .send_request(subject, request)
            .await
            .map_err(|e| match e.kind() {
                async_nats::RequestErrorKind::TimedOut => {
                    DispatchError::Timeout(payload.timeout_seconds)
                }
                _ => DispatchError::Unreachable(e.to_string()),
            })?;

        let reply: AgentReply = serde_json::from_slice(&message.payload)
            .map_err(|e| DispatchError::Failed(format!("malformed agent reply: {e}")))?;
        reply.into_result()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_success() {
        let reply: AgentReply =
            serde_json::from_value(json!({"success": true, "result": {"labels": 3}})).unwrap();
        assert_eq!(reply.into_result().unwrap(), json!({"labels": 3}));
    }

    #[test]
    fn test_reply_failure() {
        let reply: AgentReply =
            serde_json::from_value(json!({"success": false, "error": "bad request"})).unwrap();
        assert_eq!(
            reply.into_result().unwrap_err(),
            DispatchError::Failed("bad request".into())
        );
        let bare: AgentReply = serde_json::from_value(json!({"success": false})).unwrap();
        assert!(bare.into_result().is_err());
    }

    #[test]
    fn test_payload_from_task() {
        let task = crate::model::Task::from_spec(
            "t1".into(),
            &crate::model::TaskSpec::new("c", "ocr").with_input(json!({"url": "x"})),
            chrono::Utc::now(),
            45,
            3,
            crate::model::RetryPolicy::Fixed,
        );
        let payload = DispatchPayload::from(&task);
        assert_eq!(payload.task_id, "t1");
        assert_eq!(payload.timeout_seconds, 45);
        assert_eq!(payload.input, json!({"url": "x"}));
    }
}
