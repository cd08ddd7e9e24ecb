//! Scripted text generator for development & testing
//! Keeps the pipeline runnable without a model behind it

use super::{ContextEntry, TextGenerator};
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Responder = Box<dyn Fn(&str, &[ContextEntry]) -> Result<String> + Send + Sync>;

/// A prompt/context pair observed by a [`ScriptedGenerator`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub context: Vec<ContextEntry>,
}

/// Closure-backed generator that records every call it receives
pub struct ScriptedGenerator {
    responder: Responder,
    delay: Option<Duration>,
    calls: AtomicUsize,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGenerator {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &[ContextEntry]) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: None,
            calls: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with the same text
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_, _| Ok(text.clone()))
    }

    /// Answer with the scripted results in order; fails fatally once exhausted
    pub fn sequence(script: Vec<Result<String>>) -> Self {
        let script = Mutex::new(VecDeque::from(script));
        Self::new(move |_, _| {
            script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front()
                .unwrap_or_else(|| {
                    Err(PipelineError::FatalCapability("script exhausted".to_string()))
                })
        })
    }

    /// Stand-in used when no model is configured: every prompt gets a
    /// conservative answer, so analysis holds and correction is skipped.
    pub fn offline() -> Self {
        Self::new(|prompt, _| {
            if prompt.contains("CORRECTION REQUEST") {
                Err(PipelineError::FatalCapability(
                    "no text generation backend configured".to_string(),
                ))
            } else {
                Ok("Offline mode: no automated assessment available.\nDECISION: HOLD".to_string())
            }
        })
    }

    /// Sleep before answering, to exercise timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, context: &[ContextEntry]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedCall {
                prompt: prompt.to_string(),
                context: context.to_vec(),
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        (self.responder)(prompt, context)
    }
}
