//! Mock gadgets for tests and examples.
//!
//! Shipped as library code so integration tests and downstream examples can
//! drive sessions without real handlers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Gadget, GadgetContext, GadgetError, GadgetOutcome, GadgetSpec, ParamSpec};

/// Returns its `m` parameter, optionally after a delay.
pub struct EchoGadget {
    delay: Duration,
}

impl EchoGadget {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoGadget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gadget for EchoGadget {
    fn name(&self) -> &str {
        "echo"
    }

    fn spec(&self) -> GadgetSpec {
        GadgetSpec {
            name: "echo".to_string(),
            description: "repeats its input".to_string(),
            params: vec![ParamSpec::required("m", "text to repeat")],
            example: "<gadget>echo:e1\n<arg>m\nhello\n</gadget>".to_string(),
        }
    }

    async fn execute(
        &self,
        params: BTreeMap<String, String>,
        ctx: GadgetContext,
    ) -> Result<GadgetOutcome, GadgetError> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(GadgetError::ExecutionFailed("cancelled".to_string()));
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        let m = params.get("m").cloned().unwrap_or_default();
        Ok(GadgetOutcome::text(m))
    }
}

/// Always fails; for dependency-cascade tests.
pub struct FailGadget {
    message: String,
}

impl FailGadget {
    pub fn new() -> Self {
        Self {
            message: "always fails".to_string(),
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for FailGadget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gadget for FailGadget {
    fn name(&self) -> &str {
        "fail"
    }

    fn spec(&self) -> GadgetSpec {
        GadgetSpec {
            name: "fail".to_string(),
            description: "always fails".to_string(),
            params: vec![],
            example: "<gadget>fail:f1\n</gadget>".to_string(),
        }
    }

    async fn execute(
        &self,
        _params: BTreeMap<String, String>,
        _ctx: GadgetContext,
    ) -> Result<GadgetOutcome, GadgetError> {
        Err(GadgetError::ExecutionFailed(self.message.clone()))
    }
}

/// Sleeps for a fixed delay and tracks its peak concurrency; for cap tests.
pub struct SlowGadget {
    delay: Duration,
    cap: Option<usize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SlowGadget {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            cap: None,
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Highest number of simultaneously running executions observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gadget for SlowGadget {
    fn name(&self) -> &str {
        "slow"
    }

    fn spec(&self) -> GadgetSpec {
        GadgetSpec {
            name: "slow".to_string(),
            description: "sleeps, then reports".to_string(),
            params: vec![],
            example: "<gadget>slow:s1\n</gadget>".to_string(),
        }
    }

    fn max_concurrency(&self) -> Option<usize> {
        self.cap
    }

    async fn execute(
        &self,
        _params: BTreeMap<String, String>,
        ctx: GadgetContext,
    ) -> Result<GadgetOutcome, GadgetError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                Err(GadgetError::ExecutionFailed("cancelled".to_string()))
            }
            _ = tokio::time::sleep(self.delay) => Ok(GadgetOutcome::text("done")),
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Succeeds and raises the break-loop signal.
pub struct BreakLoopGadget;

#[async_trait]
impl Gadget for BreakLoopGadget {
    fn name(&self) -> &str {
        "finish"
    }

    fn spec(&self) -> GadgetSpec {
        GadgetSpec {
            name: "finish".to_string(),
            description: "signals the agent loop to stop".to_string(),
            params: vec![ParamSpec::optional("summary", "final summary text")],
            example: "<gadget>finish:f1\n<arg>summary\nall done\n</gadget>".to_string(),
        }
    }

    async fn execute(
        &self,
        params: BTreeMap<String, String>,
        _ctx: GadgetContext,
    ) -> Result<GadgetOutcome, GadgetError> {
        let summary = params.get("summary").cloned().unwrap_or_default();
        Ok(GadgetOutcome::text(summary).with_breaks_loop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_its_parameter() {
        let g = EchoGadget::new();
        let mut params = BTreeMap::new();
        params.insert("m".to_string(), "hi".to_string());
        let out = g
            .execute(params, GadgetContext::detached("a", "echo"))
            .await
            .unwrap();
        assert_eq!(out.text, "hi");
        assert!(!out.breaks_loop);
    }

    #[tokio::test]
    async fn fail_gadget_always_errors() {
        let g = FailGadget::with_message("boom");
        let err = g
            .execute(BTreeMap::new(), GadgetContext::detached("x", "fail"))
            .await
            .unwrap_err();
        assert_eq!(err, GadgetError::ExecutionFailed("boom".to_string()));
    }

    #[tokio::test]
    async fn slow_gadget_tracks_peak_concurrency() {
        let g = Arc::new(SlowGadget::new(Duration::from_millis(20)));
        let a = Arc::clone(&g);
        let b = Arc::clone(&g);
        let t1 = tokio::spawn(async move {
            a.execute(BTreeMap::new(), GadgetContext::detached("1", "slow"))
                .await
        });
        let t2 = tokio::spawn(async move {
            b.execute(BTreeMap::new(), GadgetContext::detached("2", "slow"))
                .await
        });
        let (r1, r2) = tokio::join!(t1, t2);
        assert!(r1.unwrap().is_ok());
        assert!(r2.unwrap().is_ok());
        assert_eq!(g.peak(), 2);
    }

    #[tokio::test]
    async fn break_loop_gadget_sets_flag() {
        let g = BreakLoopGadget;
        let out = g
            .execute(BTreeMap::new(), GadgetContext::detached("f", "finish"))
            .await
            .unwrap();
        assert!(out.breaks_loop);
    }

    #[tokio::test]
    async fn echo_with_delay_respects_cancellation() {
        let g = EchoGadget::with_delay(Duration::from_secs(30));
        let ctx = GadgetContext::detached("a", "echo");
        ctx.cancel.cancel();
        let err = g.execute(BTreeMap::new(), ctx).await.unwrap_err();
        assert!(matches!(err, GadgetError::ExecutionFailed(_)));
    }
}
