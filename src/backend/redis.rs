// src/backend/redis.rs

//! Redis-compatible backend.
//!
//! The atomic primitive is a Lua script, so a compare-and-swap executes on
//! the server without any other client's write interleaving.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::KvBackend;
use crate::errors::{BackendError, BackendResult};

/// KEYS[1] = key
/// ARGV[1] = "1" if a current value is expected, "0" if the key must be absent
/// ARGV[2] = expected value
/// ARGV[3] = "1" to write ARGV[4], "0" to delete
/// ARGV[4] = new value
/// ARGV[5] = ttl in milliseconds, "0" for none
const COMPARE_AND_SWAP_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
if ARGV[3] == '1' then
  local ttl = tonumber(ARGV[5])
  if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[4], 'PX', ttl)
  else
    redis.call('SET', KEYS[1], ARGV[4])
  end
else
  redis.call('DEL', KEYS[1])
end
return 1
"#;

pub struct RedisBackend {
    conn: ConnectionManager,
    cas_script: Script,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str) -> BackendResult<Self> {
        info!(url, "connecting to redis backend");

        let client = Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;

        let pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(BackendError::Unavailable(format!(
                "unexpected PING reply from {url}: {pong}"
            )));
        }

        Ok(Self {
            conn,
            cas_script: Script::new(COMPARE_AND_SWAP_LUA),
        })
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    // Redis rejects PX 0; round sub-millisecond TTLs up.
    ttl.map(|d| (d.as_millis() as u64).max(1)).unwrap_or(0)
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl.is_some() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or(""))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        debug!(key, swapped = swapped == 1, "redis compare-and-swap");
        Ok(swapped == 1)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if ttl.is_some() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn ping(&self) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
