//! Interceptor registry, construction-time composition and lifecycle hooks.

pub mod compose;
pub mod dispatch;
mod guard;
pub mod hooks;
pub mod registry;

pub use compose::Composer;
pub use dispatch::HookDispatcher;
pub use hooks::{
    ConstructContext, ConstructInterceptor, Decoration, MessageContext, MessageInterceptor,
    MessageStage, SendContext, SendInterceptor, SendStage,
};
pub use registry::{Interceptor, InterceptorId, InterceptorRegistry, Registration};
