// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `ModelTransport` collaborator boundary (spec §6).
//!
//! Concrete per-provider HTTP drivers are out of scope ("model API
//! transport") — this module defines only the trait boundary, grounded on
//! `sven-model/src/provider.rs`'s `ModelProvider` trait, plus a `Mock`
//! implementation for tests.

use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

use crate::catalog::InputModality;
use crate::types::Message;

/// One streamed event from a model completion call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallDelta { id: String, name: String, arguments_fragment: String },
    Done { stop_reason: Option<crate::types::StopReason> },
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// A request to complete a transcript.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub max_output_tokens: Option<u32>,
}

/// Boundary trait any concrete model transport would implement. Mozi's core
/// crates depend on this trait only — no implementer beyond [`MockProvider`]
/// ships in this workspace.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    fn catalog_max_output_tokens(&self) -> Option<u32> {
        None
    }

    fn catalog_context_window(&self) -> Option<u32> {
        None
    }

    /// Some transports (local model servers) can be probed live for their
    /// configured context window rather than relying on a static catalog.
    async fn probe_context_window(&self) -> Option<u32> {
        None
    }

    fn input_modalities(&self) -> Vec<InputModality> {
        vec![InputModality::Text]
    }

    fn supports_images(&self) -> bool {
        self.input_modalities().contains(&InputModality::Image)
    }
}

/// A deterministic in-memory transport for tests.
pub struct MockProvider {
    pub name: String,
    pub model: String,
    pub modalities: Vec<InputModality>,
    pub reply: String,
}

impl MockProvider {
    pub fn new(model: impl Into<String>, reply: impl Into<String>) -> Self {
        MockProvider {
            name: "mock".into(),
            model: model.into(),
            modalities: vec![InputModality::Text],
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl ModelTransport for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let events = vec![
            Ok(ResponseEvent::TextDelta(self.reply.clone())),
            Ok(ResponseEvent::Done {
                stop_reason: Some(crate::types::StopReason::EndTurn),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn input_modalities(&self) -> Vec<InputModality> {
        self.modalities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn mock_provider_streams_reply_then_done() {
        let provider = MockProvider::new("mock-model", "hi there");
        let mut stream = provider
            .complete(CompletionRequest {
                messages: vec![],
                system_prompt: None,
                max_output_tokens: None,
            })
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, ResponseEvent::TextDelta("hi there".to_string()));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, ResponseEvent::Done { .. }));
    }

    #[test]
    fn default_modalities_are_text_only() {
        struct Bare;
        #[async_trait]
        impl ModelTransport for Bare {
            fn name(&self) -> &str {
                "bare"
            }
            fn model_name(&self) -> &str {
                "bare-model"
            }
            async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
                Ok(Box::pin(futures::stream::empty()))
            }
        }
        let b = Bare;
        assert_eq!(b.input_modalities(), vec![InputModality::Text]);
        assert!(!b.supports_images());
    }
}
