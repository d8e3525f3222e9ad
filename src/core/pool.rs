//! Recycling of [`RequestContext`] instances.
//!
//! [`ContextPool::acquire`] hands out a [`PooledContext`] guard. Dropping the
//! guard resets the context and returns it to the free list, so release runs on
//! every exit path: normal completion, an unwinding panic, or a request future
//! dropped by the engine after a client disconnect.
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::core::context::RequestContext;

#[derive(Debug)]
pub struct ContextPool {
    idle: Mutex<Vec<Box<RequestContext>>>,
    max_idle: usize,
}

impl ContextPool {
    /// Pool keeping at most `max_idle` released contexts.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
        }
    }

    /// Take a clean context, reusing an idle one when available.
    pub fn acquire(self: &Arc<Self>) -> PooledContext {
        let ctx = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(RequestContext::default()));
        debug_assert!(ctx.is_clean(), "pooled context was not reset");

        PooledContext {
            ctx: Some(ctx),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut ctx: Box<RequestContext>) {
        // cancel before reset so spawned work tied to this request stops
        ctx.cancellation().cancel();
        ctx.reset();

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(ctx);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Exclusive handle on a pooled context; releases it on drop.
#[derive(Debug)]
pub struct PooledContext {
    ctx: Option<Box<RequestContext>>,
    pool: Arc<ContextPool>,
}

impl PooledContext {
    /// Address of the underlying instance, stable across reuse.
    pub fn instance_addr(&self) -> usize {
        self.ctx
            .as_deref()
            .map_or(0, |ctx| ctx as *const RequestContext as usize)
    }
}

impl Deref for PooledContext {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        // Only `Drop` takes the box out.
        self.ctx.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut RequestContext {
        self.ctx.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}
