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

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::config::DbPostgresConfig;
use crate::retries::with_retries;

impl From<&DbPostgresConfig> for PgConnectOptions {
    fn from(config: &DbPostgresConfig) -> Self {
        PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
    }
}

/// Creates the Postgres pool, waiting for the database to come up the
/// way the deployment images do before starting any service process.
pub async fn create_postgres_pool(
    config: &DbPostgresConfig,
) -> Result<Pool<Postgres>, sqlx::Error> {
    info!(
        "DB Pool: postgres://{}:{}/{}",
        config.host, config.port, config.database
    );

    with_retries(
        "db",
        "connect",
        Some(format!("{}:{}", config.host, config.port)),
        &config.retries,
        config,
        |config| {
            Box::pin(async move {
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect_with(PgConnectOptions::from(config))
                    .await
            })
        },
        |error| matches!(error, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut),
    )
    .await
}
