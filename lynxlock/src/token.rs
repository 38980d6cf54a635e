use std::sync::Arc;

use lynxlock_store::{LockError, LockScript, ScriptStore};

/// Allocates fencing tokens from the store-side counter.
///
/// The counter lives in the store so it survives process restarts;
/// tokens are strictly monotonically increasing across every process
/// sharing the same counter key.
pub(crate) struct TokenAllocator {
    store: Arc<dyn ScriptStore>,
    counter_key: Vec<String>,
}

impl TokenAllocator {
    pub(crate) fn new(store: Arc<dyn ScriptStore>, counter_key: String) -> Self {
        Self {
            store,
            counter_key: vec![counter_key],
        }
    }

    /// Increment the counter and return the new token.
    pub(crate) async fn next_token(&self) -> Result<i64, LockError> {
        let reply = self
            .store
            .eval(LockScript::Counter, &self.counter_key, &[])
            .await?;
        reply
            .as_int()
            .ok_or_else(|| LockError::Protocol("token counter returned a non-integer".into()))
    }
}
