//! Generic blocking buffer pool.
//!
//! A [`BufferPool`] hands out [`SmartBuffer`]s, shared handles whose last
//! drop returns the underlying buffer to the pool instead of freeing it. The
//! concrete buffer type only supplies allocation and release through
//! [`BufferAllocator`].
//!
//! Growth and retention are controlled by two bounds:
//!
//! - `auto_allocate`: `request()` may allocate inline while the pool holds
//!   fewer buffers than this; beyond it, `request()` blocks until a buffer
//!   comes back.
//! - `auto_free`: once this many idle buffers sit in the pool, further
//!   returns are released through the allocator.

use crate::error::Result;
use crate::sync::lock;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Allocation hooks for one concrete buffer type.
pub trait BufferAllocator: Send + Sync + 'static {
    type Buffer: Send + Sync + 'static;

    fn allocate(&self) -> Result<Self::Buffer>;

    fn release(&self, _buffer: Self::Buffer) {}
}

struct PoolState<B> {
    available: Vec<B>,
    /// Buffers that exist, whether idle or handed out.
    total: usize,
    /// Inline allocations currently running outside the lock.
    allocating: usize,
    auto_allocate: usize,
    auto_free: Option<usize>,
}

struct PoolInner<A: BufferAllocator> {
    name: String,
    allocator: A,
    state: Mutex<PoolState<A::Buffer>>,
    returned: Condvar,
}

impl<A: BufferAllocator> PoolInner<A> {
    fn state(&self) -> MutexGuard<'_, PoolState<A::Buffer>> {
        lock(&self.state)
    }

    /// Called exactly once per handed-out buffer, from the last handle drop.
    fn recycle(&self, buffer: A::Buffer) {
        let mut st = self.state();
        let over_retention = st.auto_free.is_some_and(|bound| st.available.len() >= bound);
        if over_retention {
            st.total -= 1;
            drop(st);
            tracing::trace!(pool = %self.name, "Buffer released over retention bound");
            self.allocator.release(buffer);
        } else {
            st.available.push(buffer);
            drop(st);
        }
        // A release also lowers `total`, which may let a waiter grow the pool.
        self.returned.notify_one();
    }
}

impl<A: BufferAllocator> Drop for PoolInner<A> {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        let idle = std::mem::take(&mut st.available);
        tracing::debug!(pool = %self.name, released = idle.len(), "Pool dropped");
        for buffer in idle {
            self.allocator.release(buffer);
        }
    }
}

/// Pool of reusable buffers.
pub struct BufferPool<A: BufferAllocator> {
    inner: Arc<PoolInner<A>>,
}

impl<A: BufferAllocator> Clone for BufferPool<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: BufferAllocator> BufferPool<A> {
    pub fn new(name: impl Into<String>, allocator: A) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                allocator,
                state: Mutex::new(PoolState {
                    available: Vec::new(),
                    total: 0,
                    allocating: 0,
                    auto_allocate: 0,
                    auto_free: None,
                }),
                returned: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn allocator(&self) -> &A {
        &self.inner.allocator
    }

    /// Allocate `count` buffers up front.
    pub fn allocate(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            let buffer = self.inner.allocator.allocate()?;
            let mut st = self.inner.state();
            st.available.push(buffer);
            st.total += 1;
        }
        self.inner.returned.notify_all();
        tracing::debug!(pool = %self.inner.name, count, "Buffers preallocated");
        Ok(())
    }

    /// Upper bound for inline growth in `request()`.
    pub fn set_auto_allocate(&self, bound: usize) {
        self.inner.state().auto_allocate = bound;
        self.inner.returned.notify_all();
    }

    /// Number of idle buffers retained before returns are released.
    pub fn set_auto_free(&self, bound: Option<usize>) {
        let mut st = self.inner.state();
        st.auto_free = bound;
        let excess = match bound {
            Some(bound) if st.available.len() > bound => st.available.split_off(bound),
            _ => Vec::new(),
        };
        st.total -= excess.len();
        drop(st);
        for buffer in excess {
            self.inner.allocator.release(buffer);
        }
    }

    pub fn available_size(&self) -> usize {
        self.inner.state().available.len()
    }

    /// Buffers currently owned by the pool, idle or handed out.
    pub fn pool_size(&self) -> usize {
        self.inner.state().total
    }

    fn wrap(&self, buffer: A::Buffer) -> SmartBuffer<A> {
        SmartBuffer {
            handle: Arc::new(PooledBuffer {
                buffer: Some(buffer),
                pool: self.inner.clone(),
            }),
        }
    }

    /// Block until a buffer is available or the pool may grow.
    ///
    /// There is no timeout: with every buffer in use and the growth bound
    /// reached this waits for a return.
    pub fn request(&self) -> Result<SmartBuffer<A>> {
        let mut st = self.inner.state();
        loop {
            if let Some(buffer) = st.available.pop() {
                return Ok(self.wrap(buffer));
            }
            if st.total + st.allocating < st.auto_allocate {
                st.allocating += 1;
                drop(st);
                let allocated = self.inner.allocator.allocate();
                let mut st = self.inner.state();
                st.allocating -= 1;
                return match allocated {
                    Ok(buffer) => {
                        st.total += 1;
                        tracing::trace!(pool = %self.inner.name, total = st.total, "Pool grew inline");
                        Ok(self.wrap(buffer))
                    }
                    Err(e) => {
                        drop(st);
                        self.inner.returned.notify_one();
                        Err(e)
                    }
                };
            }
            tracing::trace!(pool = %self.inner.name, "Waiting for a returned buffer");
            st = self
                .inner
                .returned
                .wait(st)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking `request()`: `Ok(None)` when the caller would have waited.
    pub fn try_request(&self) -> Result<Option<SmartBuffer<A>>> {
        {
            let mut st = self.inner.state();
            if let Some(buffer) = st.available.pop() {
                return Ok(Some(self.wrap(buffer)));
            }
            if st.total + st.allocating >= st.auto_allocate {
                return Ok(None);
            }
        }
        self.request().map(Some)
    }
}

impl<A: BufferAllocator> fmt::Debug for BufferPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state();
        f.debug_struct("BufferPool")
            .field("name", &self.inner.name)
            .field("available", &st.available.len())
            .field("total", &st.total)
            .field("auto_allocate", &st.auto_allocate)
            .field("auto_free", &st.auto_free)
            .finish()
    }
}

/// The shared allocation behind a [`SmartBuffer`].
pub struct PooledBuffer<A: BufferAllocator> {
    buffer: Option<A::Buffer>,
    pool: Arc<PoolInner<A>>,
}

impl<A: BufferAllocator> Drop for PooledBuffer<A> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.recycle(buffer);
        }
    }
}

/// Reference-counted handle to a pooled buffer.
///
/// Clones share the buffer; dropping the last clone recycles it.
pub struct SmartBuffer<A: BufferAllocator> {
    handle: Arc<PooledBuffer<A>>,
}

impl<A: BufferAllocator> Clone for SmartBuffer<A> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<A: BufferAllocator> SmartBuffer<A> {
    /// Live handles sharing this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.handle)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl<A: BufferAllocator> Deref for SmartBuffer<A> {
    type Target = A::Buffer;

    fn deref(&self) -> &A::Buffer {
        // Only taken in drop
        match &self.handle.buffer {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer accessed after recycle"),
        }
    }
}

impl<A: BufferAllocator> fmt::Debug for SmartBuffer<A>
where
    A::Buffer: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartBuffer")
            .field("buffer", &**self)
            .field("refs", &self.ref_count())
            .finish()
    }
}
