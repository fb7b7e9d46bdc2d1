use std::sync::Arc;

use tracing::debug;

use super::guard::guarded;
use super::hooks::{ConstructContext, ConstructInterceptor, Decoration};
use super::registry::{Interceptor, InterceptorRegistry};
use crate::client::{AccessPoint, Component, Consumer, Producer};

/// Folds construction interceptors over a freshly built instance.
///
/// Interceptors apply in registration order, each seeing the previous one's
/// result. A failing interceptor is skipped; the chain continues.
#[derive(Clone)]
pub struct Composer {
    registry: Arc<InterceptorRegistry>,
}

impl Composer {
    #[must_use]
    pub fn new(registry: Arc<InterceptorRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn compose_access_point(&self, base: Arc<dyn AccessPoint>) -> Arc<dyn AccessPoint> {
        self.fold(base, |i| match i {
            Interceptor::AccessPoint(x) => Some(x),
            _ => None,
        })
    }

    #[must_use]
    pub fn compose_producer(&self, base: Arc<dyn Producer>) -> Arc<dyn Producer> {
        self.fold(base, |i| match i {
            Interceptor::Producer(x) => Some(x),
            _ => None,
        })
    }

    #[must_use]
    pub fn compose_consumer(&self, base: Arc<dyn Consumer>) -> Arc<dyn Consumer> {
        self.fold(base, |i| match i {
            Interceptor::Consumer(x) => Some(x),
            _ => None,
        })
    }

    fn fold<T>(
        &self,
        base: Arc<T>,
        select: impl Fn(&Interceptor) -> Option<&Arc<dyn ConstructInterceptor<T>>>,
    ) -> Arc<T>
    where
        T: ?Sized + Component + 'static,
    {
        let snapshot = self.registry.snapshot();
        let mut current = base;
        for registration in snapshot.iter() {
            let Some(interceptor) = select(registration.interceptor()) else {
                continue;
            };
            let decoration = {
                let ctx = ConstructContext::new(&current);
                guarded("construct", registration.name(), || interceptor.construct(&ctx))
            };
            if let Some(Decoration::Replaced(next)) = decoration {
                debug!(interceptor = registration.name(), "instance decorated");
                current = next;
            }
        }
        current
    }
}
