//! Executor: resolve a call to a gadget, validate, run under a deadline,
//! and report a classified outcome.
//!
//! The gadget runs on its own task so a panic is trapped and classified as
//! an Execution failure instead of tearing down the session. Every await
//! races the cancellation token.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use run_event::ErrorKind;

use crate::error::InvocationError;
use crate::gadget::{GadgetContext, GadgetError, GadgetOutcome, GadgetRegistry};
use crate::parser::InvocationCall;

/// Drives one invocation from resolved call to classified outcome.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<GadgetRegistry>,
    default_timeout: Duration,
}

impl Executor {
    pub fn new(registry: Arc<GadgetRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    /// Runs one invocation. All failure modes come back as
    /// [`InvocationError`]; the session itself never fails here.
    pub async fn execute(
        &self,
        call: &InvocationCall,
        params: BTreeMap<String, String>,
        ctx: GadgetContext,
    ) -> Result<GadgetOutcome, InvocationError> {
        let Some(gadget) = self.registry.lookup(&call.gadget) else {
            return Err(InvocationError::unknown(&call.gadget));
        };

        if let Err(message) = gadget.validate(&params) {
            let spec = gadget.spec();
            return Err(InvocationError::validation(format!(
                "{message}\nusage: {}\nexample:\n{}",
                spec.usage_summary(),
                spec.example
            )));
        }

        let deadline = gadget.timeout().unwrap_or(self.default_timeout);
        let cancel = ctx.cancel.clone();

        let handle = tokio::spawn({
            let gadget = Arc::clone(&gadget);
            async move { gadget.execute(params, ctx).await }
        });
        let abort = handle.abort_handle();

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort.abort();
                return Err(InvocationError::cancelled());
            }
            joined = tokio::time::timeout(deadline, handle) => joined,
        };

        match joined {
            Err(_elapsed) => {
                abort.abort();
                Err(InvocationError::timeout(deadline))
            }
            Ok(Err(join_error)) => Err(InvocationError::execution(format!(
                "gadget task failed: {join_error}"
            ))),
            Ok(Ok(Err(GadgetError::InvalidArguments(message)))) => Err(InvocationError::new(
                ErrorKind::Validation,
                format!("invalid arguments: {message}"),
            )),
            Ok(Ok(Err(GadgetError::ExecutionFailed(message)))) => {
                Err(InvocationError::execution(message))
            }
            Ok(Ok(Ok(outcome))) => Ok(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::{EchoGadget, FailGadget, Gadget, GadgetSpec};
    use crate::parser::call;
    use async_trait::async_trait;

    fn registry() -> Arc<GadgetRegistry> {
        let registry = GadgetRegistry::new();
        registry.register(Arc::new(EchoGadget::new())).unwrap();
        registry.register(Arc::new(FailGadget::new())).unwrap();
        Arc::new(registry)
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn unknown_gadget_classified() {
        let executor = Executor::new(registry(), Duration::from_secs(5));
        let c = call("nope", "a", &[], &[]);
        let err = executor
            .execute(&c, BTreeMap::new(), GadgetContext::detached("a", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn validation_failure_includes_usage_and_example() {
        let executor = Executor::new(registry(), Duration::from_secs(5));
        let c = call("echo", "a", &[], &[]);
        let err = executor
            .execute(&c, BTreeMap::new(), GadgetContext::detached("a", "echo"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("usage: echo(m)"), "{}", err.message);
        assert!(err.message.contains("example:"), "{}", err.message);
        assert!(err.message.contains("<gadget>echo"), "{}", err.message);
    }

    #[tokio::test]
    async fn case_insensitive_lookup_and_success() {
        let executor = Executor::new(registry(), Duration::from_secs(5));
        let c = call("Echo", "a", &[], &[("m", "hi")]);
        let out = executor
            .execute(&c, params(&[("m", "hi")]), GadgetContext::detached("a", "Echo"))
            .await
            .unwrap();
        assert_eq!(out.text, "hi");
    }

    #[tokio::test]
    async fn gadget_error_classified_execution() {
        let executor = Executor::new(registry(), Duration::from_secs(5));
        let c = call("fail", "x", &[], &[]);
        let err = executor
            .execute(&c, BTreeMap::new(), GadgetContext::detached("x", "fail"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Execution);
        assert!(err.message.contains("always fails"), "{}", err.message);
    }

    struct PanickyGadget;

    #[async_trait]
    impl Gadget for PanickyGadget {
        fn name(&self) -> &str {
            "panicky"
        }

        fn spec(&self) -> GadgetSpec {
            GadgetSpec {
                name: "panicky".to_string(),
                description: "panics".to_string(),
                params: vec![],
                example: String::new(),
            }
        }

        async fn execute(
            &self,
            _params: BTreeMap<String, String>,
            _ctx: GadgetContext,
        ) -> Result<GadgetOutcome, GadgetError> {
            panic!("deliberate panic");
        }
    }

    #[tokio::test]
    async fn panic_classified_execution_not_propagated() {
        let reg = GadgetRegistry::new();
        reg.register(Arc::new(PanickyGadget)).unwrap();
        let executor = Executor::new(Arc::new(reg), Duration::from_secs(5));
        let c = call("panicky", "p", &[], &[]);
        let err = executor
            .execute(&c, BTreeMap::new(), GadgetContext::detached("p", "panicky"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Execution);
        assert!(err.message.contains("gadget task failed"), "{}", err.message);
    }

    struct NeverGadget;

    #[async_trait]
    impl Gadget for NeverGadget {
        fn name(&self) -> &str {
            "never"
        }

        fn spec(&self) -> GadgetSpec {
            GadgetSpec {
                name: "never".to_string(),
                description: "never returns".to_string(),
                params: vec![],
                example: String::new(),
            }
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(30))
        }

        async fn execute(
            &self,
            _params: BTreeMap<String, String>,
            _ctx: GadgetContext,
        ) -> Result<GadgetOutcome, GadgetError> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn gadget_timeout_override_wins_over_default() {
        let reg = GadgetRegistry::new();
        reg.register(Arc::new(NeverGadget)).unwrap();
        let executor = Executor::new(Arc::new(reg), Duration::from_secs(3600));
        let c = call("never", "n", &[], &[]);
        let started = std::time::Instant::now();
        let err = executor
            .execute(&c, BTreeMap::new(), GadgetContext::detached("n", "never"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.message.contains("30ms"), "{}", err.message);
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let reg = GadgetRegistry::new();
        reg.register(Arc::new(EchoGadget::with_delay(Duration::from_secs(60))))
            .unwrap();
        let executor = Executor::new(Arc::new(reg), Duration::from_secs(3600));
        let c = call("echo", "a", &[], &[("m", "hi")]);
        let ctx = GadgetContext::detached("a", "echo");
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn({
            let executor = executor.clone();
            let p = params(&[("m", "hi")]);
            async move { executor.execute(&c, p, ctx).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
