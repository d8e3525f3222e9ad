//! Panic containment around the handler chain.
//!
//! [`PanicGuard::run`] polls the downstream chain inside `catch_unwind`. A
//! panic is turned into a [`RequestFault`]; [`PanicGuard::contain`] then forces
//! the request into a 500 server-error abort and forwards a report to the
//! notifier. Neither a failing nor a panicking notifier escapes the guard.
use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Once},
};

use futures_util::FutureExt;

use crate::{
    core::{context::RequestContext, error::RequestFault},
    ports::notifier::{PanicNotifier, PanicReport},
};

thread_local! {
    static LAST_PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Install (once per process) a panic hook recording the panicking thread's
/// backtrace, then delegating to the previously installed hook.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = format!("{info}\n{}", Backtrace::force_capture());
            LAST_PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

fn take_panic_stack() -> String {
    LAST_PANIC_STACK
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string())
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct PanicGuard {
    notifier: Option<Arc<dyn PanicNotifier>>,
}

impl PanicGuard {
    pub fn new(notifier: Option<Arc<dyn PanicNotifier>>) -> Self {
        install_panic_hook();
        Self { notifier }
    }

    /// Drive `chain` to completion, capturing a panic as a [`RequestFault`].
    pub async fn run<F>(&self, chain: F) -> Result<(), RequestFault>
    where
        F: Future<Output = ()>,
    {
        match AssertUnwindSafe(chain).catch_unwind().await {
            Ok(()) => Ok(()),
            Err(payload) => Err(RequestFault {
                message: panic_message(payload.as_ref()),
                stack: take_panic_stack(),
            }),
        }
    }

    /// Classify the fault onto the context and notify operators.
    ///
    /// The notification runs on its own task; the response does not wait for it.
    pub fn contain(&self, ctx: &mut RequestContext, fault: &RequestFault) {
        tracing::error!(
            panic = %fault.message,
            stack = %fault.stack,
            trace_id = ctx.trace_id().unwrap_or_default(),
            "got panic"
        );

        ctx.force_abort(fault.classify());

        let Some(notifier) = self.notifier.clone() else {
            return;
        };

        let report = PanicReport {
            method: ctx.method().to_string(),
            host: ctx.host().to_string(),
            uri: ctx.decoded_uri(),
            trace_id: ctx.trace_id().unwrap_or_default().to_string(),
            message: fault.message.clone(),
            stack: fault.stack.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        tokio::spawn(async move {
            match AssertUnwindSafe(notifier.notify(&report))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => tracing::debug!("Panic notification delivered"),
                Ok(Err(e)) => tracing::error!("Panic notification failed: {}", e),
                Err(payload) => tracing::error!(
                    "Panic notifier panicked: {}",
                    panic_message(payload.as_ref())
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        core::error::{BusinessCode, ClassifiedError},
        ports::notifier::NotifyError,
    };

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PanicNotifier for CountingNotifier {
        async fn notify(&self, report: &PanicReport) -> Result<(), NotifyError> {
            assert!(!report.stack.is_empty());
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::Delivery("smtp down".to_string()))
        }
    }

    struct PanickingNotifier;

    struct SlowNotifier {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl PanicNotifier for SlowNotifier {
        async fn notify(&self, _report: &PanicReport) -> Result<(), NotifyError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn settle(done: impl Fn() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn exploding(message: String) {
        panic!("{message}");
    }

    #[async_trait]
    impl PanicNotifier for PanickingNotifier {
        async fn notify(&self, _report: &PanicReport) -> Result<(), NotifyError> {
            panic!("notifier exploded");
        }
    }

    #[tokio::test]
    async fn run_passes_through_normal_completion() {
        let guard = PanicGuard::new(None);
        assert!(guard.run(async {}).await.is_ok());
    }

    #[tokio::test]
    async fn run_captures_message_and_stack() {
        let guard = PanicGuard::new(None);
        let fault = guard
            .run(exploding(format!("division by zero in {}", "pricing")))
            .await
            .unwrap_err();

        assert_eq!(fault.message, "division by zero in pricing");
        assert!(!fault.stack.is_empty());
    }

    #[tokio::test]
    async fn contain_overrides_handler_abort_and_notifies_once() {
        let notifier = Arc::new(CountingNotifier::default());
        let guard = PanicGuard::new(Some(notifier.clone()));
        let mut ctx = RequestContext::default();
        ctx.abort(ClassifiedError::param_bind_error());

        let fault = guard.run(exploding("boom".to_string())).await.unwrap_err();
        guard.contain(&mut ctx, &fault);

        let err = ctx.abort_error().unwrap();
        assert_eq!(err.business_code(), BusinessCode::ServerError.code());

        settle(|| notifier.calls.load(Ordering::SeqCst) > 0).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn contain_does_not_wait_for_slow_notifier() {
        let notifier = Arc::new(SlowNotifier {
            delivered: AtomicUsize::new(0),
        });
        let guard = PanicGuard::new(Some(notifier.clone()));
        let mut ctx = RequestContext::default();

        let fault = guard.run(exploding("boom".to_string())).await.unwrap_err();
        let started = tokio::time::Instant::now();
        guard.contain(&mut ctx, &fault);

        assert!(ctx.is_aborted());
        assert_eq!(started.elapsed(), std::time::Duration::ZERO);
        assert_eq!(notifier.delivered.load(Ordering::SeqCst), 0);

        tokio::time::sleep(std::time::Duration::from_secs(31)).await;
        assert_eq!(notifier.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_notifier_does_not_escape() {
        let guard = PanicGuard::new(Some(Arc::new(PanickingNotifier)));
        let mut ctx = RequestContext::default();

        let fault = guard.run(exploding("boom".to_string())).await.unwrap_err();
        guard.contain(&mut ctx, &fault);

        assert!(ctx.is_aborted());
    }

    #[test]
    fn panic_message_handles_payload_kinds() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&42_u32), "unknown panic payload");
    }
}
