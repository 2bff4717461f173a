use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};

/// Shared Redis handles: a multiplexed manager for commands and scripts, and
/// the client for dedicated pub/sub connections.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}
