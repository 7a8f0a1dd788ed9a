//! Compensating actions for multi-step operations.
//!
//! Each step that changes hardware or mount state pushes the action that
//! undoes it.  If a later step fails, or the caller's cancellation token fires
//! at a checkpoint, [`Rollback::unwind`] runs the pushed actions in reverse
//! order before the error is returned.  [`Rollback::commit`] forgets them once
//! the whole operation succeeded.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CsiError;

type Compensation = BoxFuture<'static, Result<(), CsiError>>;

pub struct Rollback {
    operation: &'static str,
    steps: Vec<(String, Compensation)>,
}

impl Rollback {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            steps: Vec::new(),
        }
    }

    /// Register the undo action for a step that just succeeded.
    pub fn push(&mut self, step: impl Into<String>, undo: Compensation) {
        self.steps.push((step.into(), undo));
    }

    /// Step boundary: fail with [`CsiError::Cancelled`] once `cancel` fired.
    pub fn check(&self, cancel: &CancellationToken) -> Result<(), CsiError> {
        if cancel.is_cancelled() {
            return Err(CsiError::Cancelled(format!(
                "{} cancelled after {} step(s)",
                self.operation,
                self.steps.len()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Run every compensation, newest first.  Failures are logged and do not
    /// stop the remaining ones.
    pub async fn unwind(mut self) {
        let operation = self.operation;
        while let Some((step, undo)) = self.steps.pop() {
            match undo.await {
                Ok(()) => debug!(operation, %step, "rolled back"),
                Err(e) => warn!(operation, %step, error = %e, "rollback step failed"),
            }
        }
    }

    /// Finish `result`: commit on success, unwind on error.
    pub async fn finish<T>(self, result: Result<T, CsiError>) -> Result<T, CsiError> {
        match result {
            Ok(v) => {
                self.commit();
                Ok(v)
            }
            Err(e) => {
                self.unwind().await;
                Err(e)
            }
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            warn!(
                operation = self.operation,
                pending = self.steps.len(),
                "rollback dropped with pending compensations"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn record(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Compensation {
        let log = Arc::clone(log);
        let name = name.to_owned();
        Box::pin(async move {
            log.lock().unwrap().push(name);
            Ok(())
        })
    }

    #[tokio::test]
    async fn unwind_runs_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rb = Rollback::new("test");
        rb.push("first", record(&log, "first"));
        rb.push(
            "failing",
            Box::pin(async { Err(CsiError::Internal("boom".into())) }),
        );
        rb.push("third", record(&log, "third"));
        rb.unwind().await;
        assert_eq!(*log.lock().unwrap(), vec!["third", "first"]);
    }

    #[tokio::test]
    async fn commit_discards() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rb = Rollback::new("test");
        rb.push("step", record(&log, "step"));
        let out = rb.finish(Ok::<_, CsiError>(7)).await.unwrap();
        assert_eq!(out, 7);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn check_reports_cancellation() {
        let rb = Rollback::new("reserve");
        let cancel = CancellationToken::new();
        assert!(rb.check(&cancel).is_ok());
        cancel.cancel();
        assert!(matches!(rb.check(&cancel), Err(CsiError::Cancelled(_))));
    }
}
