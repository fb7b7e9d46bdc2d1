use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;

use super::hooks::{ConstructInterceptor, MessageInterceptor, SendInterceptor};
use crate::client::{AccessPoint, Consumer, Producer};

/// Handle returned by [`InterceptorRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterceptorId(u64);

/// One interceptor, tagged by what it intercepts.
#[derive(Clone)]
pub enum Interceptor {
    AccessPoint(Arc<dyn ConstructInterceptor<dyn AccessPoint>>),
    Producer(Arc<dyn ConstructInterceptor<dyn Producer>>),
    Consumer(Arc<dyn ConstructInterceptor<dyn Consumer>>),
    Send(Arc<dyn SendInterceptor>),
    OnMessage(Arc<dyn MessageInterceptor>),
}

impl Interceptor {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Interceptor::AccessPoint(_) => "access_point",
            Interceptor::Producer(_) => "producer",
            Interceptor::Consumer(_) => "consumer",
            Interceptor::Send(_) => "send",
            Interceptor::OnMessage(_) => "on_message",
        }
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Interceptor").field(&self.kind()).finish()
    }
}

#[derive(Debug)]
pub struct Registration {
    id: InterceptorId,
    name: String,
    interceptor: Interceptor,
}

impl Registration {
    #[must_use]
    pub fn id(&self) -> InterceptorId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }
}

/// Registration-ordered list of interceptors.
///
/// Readers take an immutable snapshot; registration and removal publish a
/// new list. A composition or dispatch that already took its snapshot is
/// unaffected by later changes.
pub struct InterceptorRegistry {
    entries: ArcSwap<Vec<Arc<Registration>>>,
    next_id: AtomicU64,
    write_lock: Mutex<()>,
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Appends an interceptor. Registration order is application order.
    pub fn register(&self, name: impl Into<String>, interceptor: Interceptor) -> InterceptorId {
        let _guard = self.write_lock.lock();
        let id = InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Arc::new(Registration {
            id,
            name: name.into(),
            interceptor,
        });
        info!(
            interceptor = registration.name(),
            kind = registration.interceptor().kind(),
            "interceptor registered"
        );
        let current = self.entries.load();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(registration);
        self.entries.store(Arc::new(next));
        id
    }

    /// Removes a registration. Returns `false` if the id is unknown.
    pub fn unregister(&self, id: InterceptorId) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.entries.load();
        let Some(index) = current.iter().position(|r| r.id == id) else {
            return false;
        };
        let mut next: Vec<_> = current.iter().cloned().collect();
        let removed = next.remove(index);
        self.entries.store(Arc::new(next));
        info!(interceptor = removed.name(), "interceptor unregistered");
        true
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Registration>>> {
        self.entries.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
