//! Application handler abstraction.
//!
//! A handler receives the request context mutably and reports its outcome only
//! through it. Closures are accepted through [`handler_fn`] (or directly by
//! [`Pipeline::register`](super::pipeline::Pipeline::register)) using the
//! boxed-future form:
//!
//! ```ignore
//! pipeline.get("/hello", |ctx| Box::pin(async move {
//!     ctx.set_payload(&"hello");
//! }));
//! ```
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::core::{
    context::{Identity, RequestContext},
    error::ClassifiedError,
};

pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()>;
}

pub type BoxedHandler = Arc<dyn Handler>;

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
        self(ctx)
    }
}

/// Box a closure as a handler.
pub fn handler_fn<F>(f: F) -> BoxedHandler
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct AliasForMetrics(String);

impl Handler for AliasForMetrics {
    fn call<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
        ctx.set_alias(&self.0);
        Box::pin(std::future::ready(()))
    }
}

/// Report the route under `alias` to metrics, e.g. `/users/:name` instead of
/// one series per user name.
pub fn alias_for_metrics(alias: impl Into<String>) -> BoxedHandler {
    Arc::new(AliasForMetrics(alias.into()))
}

struct DisableTrace;

impl Handler for DisableTrace {
    fn call<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
        ctx.disable_trace();
        Box::pin(std::future::ready(()))
    }
}

/// Skip tracing for the route this handler is chained on.
pub fn disable_trace() -> BoxedHandler {
    Arc::new(DisableTrace)
}

struct Authenticate<F>(F);

impl<F> Handler for Authenticate<F>
where
    F: for<'a> Fn(&'a RequestContext) -> BoxFuture<'a, Result<Identity, ClassifiedError>>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let outcome = (self.0)(&*ctx).await;
            match outcome {
                Ok(identity) => {
                    ctx.set_identity(identity);
                }
                Err(err) => ctx.abort(err),
            }
        })
    }
}

/// Auth adapter: resolve the caller identity or abort the chain.
///
/// Later handlers read the result through
/// [`RequestContext::user_id`] / [`RequestContext::user_name`].
pub fn auth<F>(authenticate: F) -> BoxedHandler
where
    F: for<'a> Fn(&'a RequestContext) -> BoxFuture<'a, Result<Identity, ClassifiedError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(Authenticate(authenticate))
}
