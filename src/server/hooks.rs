use std::panic::{AssertUnwindSafe, catch_unwind};

use bytes::Bytes;

use crate::env::Env;
use crate::error::AppError;
use crate::http::RequestHead;

/// Parser-level callbacks for each request on a connection.
///
/// An error from [`on_headers`](Self::on_headers) or
/// [`on_body`](Self::on_body) marks the request failed: the rest of its body
/// is still read and discarded, the chain is skipped and the error is sent as
/// the response. Later pipelined requests are unaffected.
pub trait RequestHooks: Send + Sync + 'static {
    /// Runs once the head has been decoded, before any body bytes.
    fn on_headers(&self, _env: &mut Env) -> Result<(), AppError> {
        Ok(())
    }

    /// Runs for each decoded body chunk. Appends it to the body by default.
    fn on_body(&self, env: &mut Env, chunk: &Bytes) -> Result<(), AppError> {
        env.body_mut().extend_from_slice(chunk);
        Ok(())
    }

    /// Runs when the request is dropped unanswered because its connection
    /// went away.
    fn on_close(&self, _head: &RequestHead) {}
}

/// Buffers the whole body and does nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl RequestHooks for DefaultHooks {}

/// Calls a hook, turning a panic into an [`AppError`].
pub(crate) fn guarded(hook: impl FnOnce() -> Result<(), AppError>) -> Result<(), AppError> {
    catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|panic| Err(AppError::from_panic(panic)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::get;

    #[test]
    fn default_body_hook_appends() {
        let mut env = get("/");
        let hooks = DefaultHooks;
        hooks.on_body(&mut env, &Bytes::from_static(b"ab")).unwrap();
        hooks.on_body(&mut env, &Bytes::from_static(b"c")).unwrap();
        assert_eq!(env.body(), b"abc");
    }

    #[test]
    fn panicking_hook_becomes_an_error() {
        let err = guarded(|| panic!("bad hook")).unwrap_err();
        assert!(matches!(err, AppError::Panicked(ref m) if m == "bad hook"));
    }
}
