use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::error::InterceptorFailure;

/// Runs one interceptor callback, containing errors and panics.
///
/// Returns `None` (after logging) when the callback failed, so the caller
/// can carry on as if the interceptor were absent.
pub(crate) fn guarded<T>(
    stage: &'static str,
    interceptor: &str,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Option<T> {
    let failure = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(err)) => InterceptorFailure::Error(err),
        Err(payload) => InterceptorFailure::Panic(panic_message(payload.as_ref())),
    };
    warn!(interceptor, stage, error = %failure, "interceptor failed, contribution discarded");
    None
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_passes_through() {
        assert_eq!(guarded("test", "ok", || Ok(5)), Some(5));
    }

    #[test]
    fn error_is_contained() {
        assert_eq!(guarded::<u8>("test", "err", || anyhow::bail!("nope")), None);
    }

    #[test]
    fn panic_is_contained() {
        assert_eq!(guarded::<u8>("test", "panics", || panic!("kaboom")), None);
    }

    #[test]
    fn panic_payloads_are_described() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
