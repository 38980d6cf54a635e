use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::debug;

use lynxlock_store::{LockError, LockScript, ScriptReply, ScriptStore};

use crate::config::RedisConfig;
use crate::scripts;

/// Redis-backed implementation of [`ScriptStore`].
///
/// Script sources are compiled into [`redis::Script`] values once at
/// construction; invocation goes by SHA1 and falls back to shipping the
/// source when the server's script cache misses.
pub struct RedisScriptStore {
    pool: Pool,
    script_timeout: Duration,
    acquire: Script,
    renew: Script,
    release: Script,
    counter: Script,
}

impl RedisScriptStore {
    /// Create a new `RedisScriptStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, LockError> {
        let cfg = Config::from_url(config.effective_url());
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| LockError::Unavailable(e.to_string()))?
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            script_timeout: config.script_timeout,
            acquire: Script::new(scripts::ACQUIRE),
            renew: Script::new(scripts::RENEW),
            release: Script::new(scripts::RELEASE),
            counter: Script::new(scripts::COUNTER),
        })
    }

    fn script(&self, script: LockScript) -> &Script {
        match script {
            LockScript::Acquire => &self.acquire,
            LockScript::Renew => &self.renew,
            LockScript::Release => &self.release,
            LockScript::Counter => &self.counter,
        }
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, LockError> {
        self.pool
            .get()
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))
    }
}

fn map_redis_err(e: &redis::RedisError) -> LockError {
    if e.code() == Some("BUSY") {
        return LockError::Busy(e.to_string());
    }
    match e.kind() {
        redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError => {
            LockError::Protocol(e.to_string())
        }
        _ => LockError::Unavailable(e.to_string()),
    }
}

fn decode_reply(value: redis::Value) -> Result<ScriptReply, LockError> {
    match value {
        redis::Value::Int(v) => Ok(ScriptReply::Int(v)),
        redis::Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(ScriptReply::Text)
            .map_err(|_| LockError::Protocol("non-utf8 script reply".into())),
        redis::Value::SimpleString(s) => Ok(ScriptReply::Text(s)),
        redis::Value::Okay => Ok(ScriptReply::Text("OK".into())),
        redis::Value::Nil => Ok(ScriptReply::Nil),
        other => Err(LockError::Protocol(format!(
            "unexpected script reply: {other:?}"
        ))),
    }
}

#[async_trait]
impl ScriptStore for RedisScriptStore {
    async fn eval(
        &self,
        script: LockScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, LockError> {
        let mut conn = self.conn().await?;

        let compiled = self.script(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let value: redis::Value =
            tokio::time::timeout(self.script_timeout, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| {
                    LockError::Unavailable(format!(
                        "script {} timed out after {:?}",
                        script.name(),
                        self.script_timeout
                    ))
                })?
                .map_err(|e| map_redis_err(&e))?;

        let reply = decode_reply(value)?;
        debug!(script = script.name(), ?reply, "script executed");
        Ok(reply)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = tokio::time::timeout(self.script_timeout, conn.get(key))
            .await
            .map_err(|_| {
                LockError::Unavailable(format!("GET timed out after {:?}", self.script_timeout))
            })?
            .map_err(|e| map_redis_err(&e))?;
        Ok(value)
    }
}
