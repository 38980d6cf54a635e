use async_trait::async_trait;

use crate::error::LockError;
use crate::script::{LockScript, ScriptReply};

/// Trait for executing the named lock scripts against a backend.
///
/// Implementations must be `Send + Sync` and safe for concurrent use.
/// Every `eval` call is atomic on the server and bounded by the
/// adapter's configured script-call timeout; exceeding it surfaces
/// [`LockError::Unavailable`].
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Execute a named script with an explicit key list and argument
    /// list, returning its reply.
    async fn eval(
        &self,
        script: LockScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, LockError>;

    /// Read a plain key. Advisory only: the value may race with expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, LockError>;
}
