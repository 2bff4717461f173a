use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::DeviceRoute;

/// Cross-instance presence: which devices of a user are connected, and where.
#[async_trait]
pub trait OnlineRegistry: Send + Sync {
    async fn set_online(&self, user_id: Uuid, route: &DeviceRoute) -> AppResult<()>;

    async fn set_offline(&self, user_id: Uuid, device_id: &str) -> AppResult<()>;

    async fn devices(&self, user_id: Uuid) -> AppResult<Vec<DeviceRoute>>;

    /// Users without connected devices are absent from the map.
    async fn online_devices_batch(
        &self,
        user_ids: &[Uuid],
    ) -> AppResult<HashMap<Uuid, Vec<DeviceRoute>>>;

    /// Refresh `last_ping_at` and the registry TTL.
    async fn touch(&self, user_id: Uuid, device_id: &str) -> AppResult<()>;

    async fn is_online(&self, user_id: Uuid) -> AppResult<bool> {
        Ok(!self.devices(user_id).await?.is_empty())
    }
}

pub fn online_key(user_id: Uuid) -> String {
    format!("im:online:user:{}", user_id)
}

/// Hash per user: device id -> [`DeviceRoute`] JSON. The whole hash expires
/// unless heartbeats keep refreshing it.
pub struct RedisOnlineRegistry {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisOnlineRegistry {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    fn decode(user_id: Uuid, raw: HashMap<String, String>) -> Vec<DeviceRoute> {
        let mut routes: Vec<DeviceRoute> = raw
            .into_iter()
            .filter_map(|(device, value)| match serde_json::from_str(&value) {
                Ok(route) => Some(route),
                Err(e) => {
                    warn!(user_id = %user_id, device_id = %device, error = %e, "Skipping corrupt device route");
                    None
                }
            })
            .collect();
        routes.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        routes
    }
}

#[async_trait]
impl OnlineRegistry for RedisOnlineRegistry {
    async fn set_online(&self, user_id: Uuid, route: &DeviceRoute) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let key = online_key(user_id);

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg(&route.device_id)
            .arg(serde_json::to_string(route)?)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl.as_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_offline(&self, user_id: Uuid, device_id: &str) -> AppResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("HDEL")
            .arg(online_key(user_id))
            .arg(device_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn devices(&self, user_id: Uuid) -> AppResult<Vec<DeviceRoute>> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(online_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(Self::decode(user_id, raw))
    }

    async fn online_devices_batch(
        &self,
        user_ids: &[Uuid],
    ) -> AppResult<HashMap<Uuid, Vec<DeviceRoute>>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        for uid in user_ids {
            pipe.cmd("HGETALL").arg(online_key(*uid));
        }
        let results: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        Ok(user_ids
            .iter()
            .zip(results)
            .map(|(uid, raw)| (*uid, Self::decode(*uid, raw)))
            .filter(|(_, routes)| !routes.is_empty())
            .collect())
    }

    async fn touch(&self, user_id: Uuid, device_id: &str) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let key = online_key(user_id);

        let raw: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg(device_id)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(());
        };

        let mut route: DeviceRoute = serde_json::from_str(&raw)?;
        route.last_ping_at = Utc::now();

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg(device_id)
            .arg(serde_json::to_string(&route)?)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl.as_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
