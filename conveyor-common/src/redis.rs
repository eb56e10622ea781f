// Copyright 2024 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use tracing::info;

use crate::config::RedisConfig;
use crate::retries::with_retries;

/// A cloneable handle to the Redis server backing the distributed locks.
///
/// All keys pass through `prefixed`, so multiple deployments (and tests)
/// can share one server without touching each other's keys.
#[derive(Clone)]
pub struct RedisPool {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisPool {
    pub async fn configured(config: &RedisConfig) -> Result<RedisPool, RedisError> {
        info!(
            "Redis: {}:{}/{} (prefix: {:?})",
            config.host, config.port, config.database, config.key_prefix
        );
        let client = Client::open(config.url())?;
        let connection = with_retries(
            "redis",
            "connect",
            Some(format!("{}:{}", config.host, config.port)),
            &config.retries,
            &client,
            |client| Box::pin(async move { client.get_multiplexed_async_connection().await }),
            |_| true,
        )
        .await?;
        Ok(RedisPool {
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Inverse of `prefixed`, for keys coming back from SCAN.
    pub fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.key_prefix).unwrap_or(key)
    }
}
