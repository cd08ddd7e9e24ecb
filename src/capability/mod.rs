//! Text generation capability
//!
//! Every stage that needs free-form reasoning goes through [`TextGenerator`].
//! Implementations only generate; timeouts and retries are applied here so
//! that all call sites degrade the same way.

use crate::config::RetryPolicy;
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, warn};

pub mod mock;
pub use mock::ScriptedGenerator;

/// One entry of accumulated context handed to the capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: String,
    pub content: String,
}

impl ContextEntry {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Opaque text-in / text-out capability
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce text for `prompt`, given the ordered context history
    async fn generate(&self, prompt: &str, context: &[ContextEntry]) -> Result<String>;
}

/// Result of a retried operation, with the number of attempts spent
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Run `operation` under the policy's timeout, retrying transient failures.
///
/// Fatal errors return immediately. A timeout counts as a transient failure.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.timeout(), operation(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(policy.timeout_ms)),
        };

        match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_transient() && attempt <= policy.max_retries => {
                warn!(
                    operation = label,
                    attempt,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(policy.backoff_for(attempt)).await;
            }
            Err(e) => {
                debug!(operation = label, attempt, error = %e, "Giving up");
                return RetryOutcome {
                    result: Err(e),
                    attempts: attempt,
                };
            }
        }
    }
}

/// `generate` with the standard timeout and bounded retry
pub async fn generate_with_retry(
    generator: &dyn TextGenerator,
    policy: &RetryPolicy,
    label: &str,
    prompt: &str,
    context: &[ContextEntry],
) -> Result<String> {
    with_retry(policy, label, move |_| generator.generate(prompt, context))
        .await
        .result
}

/// Strip markdown code fences a model may wrap around JSON
pub fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff_ms: 1,
            timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_then_succeed() {
        let generator = ScriptedGenerator::sequence(vec![
            Err(PipelineError::TransientCapability("rate limited".into())),
            Ok("done".to_string()),
        ]);

        let out = generate_with_retry(&generator, &fast_policy(), "test", "p", &[]).await;
        tokio_test::assert_ok!(&out);
        assert_eq!(out.unwrap(), "done");
        assert_eq!(generator.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let generator = ScriptedGenerator::new(|_, _| {
            Err(PipelineError::TransientCapability("still down".into()))
        });

        let outcome = with_retry(&fast_policy(), "test", |_| generator.generate("p", &[])).await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(generator.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let generator =
            ScriptedGenerator::new(|_, _| Err(PipelineError::FatalCapability("bad key".into())));

        let out = generate_with_retry(&generator, &fast_policy(), "test", "p", &[]).await;
        tokio_test::assert_err!(&out);
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient_failure() {
        let generator = Arc::new(
            ScriptedGenerator::always("late").with_delay(Duration::from_millis(200)),
        );

        let outcome = with_retry(&fast_policy(), "test", |_| {
            let generator = generator.clone();
            async move { generator.generate("p", &[]).await }
        })
        .await;

        assert!(matches!(outcome.result, Err(PipelineError::Timeout(50))));
        assert_eq!(outcome.attempts, 3);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }
}
