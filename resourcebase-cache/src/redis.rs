use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use resourcebase_core::{EngineError, EngineResult};

use crate::driver::CacheDriver;

/// Redis-backed cache driver. No teacher precedent for this crate exists in the
/// retrieved pack; it is pulled in solely because the cache engine's driver set
/// names Redis explicitly (see `DESIGN.md`).
pub struct RedisCacheDriver {
    connection: MultiplexedConnection,
}

impl RedisCacheDriver {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url).map_err(|e| anyhow::anyhow!("invalid redis url: {e}"))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to redis: {e}"))?;
        Ok(Self { connection })
    }
}

fn redis_err(e: redis::RedisError) -> EngineError {
    anyhow::anyhow!("redis error: {e}").into()
}

#[async_trait]
impl CacheDriver for RedisCacheDriver {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(redis_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set(key, value).await.map_err(redis_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await.map_err(redis_err)?;
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> EngineResult<()> {
        let mut conn = self.connection.clone();
        let pattern = format!("{prefix}*");
        let matching: Vec<String> = conn.keys(&pattern).await.map_err(redis_err)?;
        if !matching.is_empty() {
            let _: () = conn.del(matching).await.map_err(redis_err)?;
        }
        Ok(())
    }

    async fn size(&self) -> EngineResult<usize> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys("*").await.map_err(redis_err)?;
        Ok(keys.len())
    }

    async fn keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let pattern = format!("{prefix}*");
        conn.keys(&pattern).await.map_err(redis_err)
    }
}
