use std::sync::Arc;

use super::guard::guarded;
use super::hooks::{MessageContext, MessageInterceptor, SendContext, SendInterceptor};
use super::registry::{Interceptor, InterceptorRegistry};

/// Calls lifecycle hooks on every matching interceptor, in registration
/// order. Failures are logged and never reach the caller.
#[derive(Clone)]
pub struct HookDispatcher {
    registry: Arc<InterceptorRegistry>,
}

impl HookDispatcher {
    #[must_use]
    pub fn new(registry: Arc<InterceptorRegistry>) -> Self {
        Self { registry }
    }

    pub fn send_before(&self, ctx: &SendContext<'_>) {
        self.each_send("send_before", |i| i.send_before(ctx));
    }

    pub fn send_after(&self, ctx: &SendContext<'_>) {
        self.each_send("send_after", |i| i.send_after(ctx));
    }

    pub fn on_message_before(&self, ctx: &MessageContext<'_>) {
        self.each_message("on_message_before", |i| i.on_message_before(ctx));
    }

    pub fn on_message_after(&self, ctx: &MessageContext<'_>) {
        self.each_message("on_message_after", |i| i.on_message_after(ctx));
    }

    fn each_send(&self, stage: &'static str, hook: impl Fn(&dyn SendInterceptor) -> anyhow::Result<()>) {
        for registration in self.registry.snapshot().iter() {
            if let Interceptor::Send(interceptor) = registration.interceptor() {
                guarded(stage, registration.name(), || hook(interceptor.as_ref()));
            }
        }
    }

    fn each_message(
        &self,
        stage: &'static str,
        hook: impl Fn(&dyn MessageInterceptor) -> anyhow::Result<()>,
    ) {
        for registration in self.registry.snapshot().iter() {
            if let Interceptor::OnMessage(interceptor) = registration.interceptor() {
                guarded(stage, registration.name(), || hook(interceptor.as_ref()));
            }
        }
    }
}
