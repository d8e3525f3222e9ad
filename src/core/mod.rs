pub mod assembler;
pub mod context;
pub mod error;
pub mod guard;
pub mod handler;
pub mod pipeline;
pub mod pool;
pub mod rate_limiter;
pub mod trace;

pub use assembler::{Outcome, ResponseAssembler, RouteMatch};
pub use context::{Identity, RequestContext};
pub use error::{BusinessCode, ClassifiedError, Failure, RequestFault};
pub use guard::PanicGuard;
pub use handler::{BoxedHandler, Handler, alias_for_metrics, auth, disable_trace, handler_fn};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineCore, RouteGroup};
pub use pool::{ContextPool, PooledContext};
pub use rate_limiter::TokenBucket;
pub use trace::{TRACE_HEADER, TraceCorrelator, TraceRecord};
