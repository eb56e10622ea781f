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

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Environment variable prefix recognized by every conveyor service.
/// Nested fields are addressed with `__` separators, e.g.
/// `CONVEYOR__LOCK_STORE__PORT=6380`.
pub const ENV_PREFIX: &str = "CONVEYOR__";

pub type ConfigExample<T> = (&'static str, T);

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

pub trait ConfigLoaderConfig: DeserializeOwned + Serialize + Default {}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoaderConfig for T {}

/// Layered configuration loader: compiled-in defaults, then the TOML
/// config file (if present), then `CONVEYOR__*` environment variables.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    make_examples: Option<fn() -> Vec<ConfigExample<T>>>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: None,
        }
    }

    pub fn new_with_examples(config_file_name: &Path) -> ConfigLoader<T>
    where
        T: HasConfigExamples<T>,
    {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: Some(T::examples),
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config, unless the process was invoked with
    /// `--dump-config` (or `--dump-config-examples`), in which case the
    /// default (or example) configuration is printed as TOML and `None`
    /// is returned so the caller can exit without starting up.
    pub fn load_or_dump_config(&self) -> Option<T> {
        let args: Vec<String> = std::env::args().collect();
        if args.iter().any(|arg| arg == "--dump-config") {
            self.dump(&T::default());
            None
        } else if args.iter().any(|arg| arg == "--dump-config-examples") {
            if let Some(make_examples) = self.make_examples {
                for (name, example) in make_examples() {
                    println!("## {name}");
                    self.dump(&example);
                }
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(error) => {
                    eprintln!("Failed to load config: {error}");
                    None
                }
            }
        }
    }

    fn dump(&self, config: &T) {
        match toml::to_string_pretty(config) {
            Ok(toml) => println!("{toml}"),
            Err(error) => eprintln!("Failed to serialize config: {error}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_jitter_factor: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_jitter_factor: Some(0.15),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: usize,
    pub key_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub retries: RetryConfig,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => format!("{username}:{password}@"),
            (None, Some(password)) => format!(":{password}@"),
            _ => "".to_string(),
        };
        format!(
            "redis://{}{}:{}/{}",
            credentials, self.host, self.port, self.database
        )
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            key_prefix: "".to_string(),
            username: None,
            password: None,
            retries: RetryConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schema: Option<String>,
    pub max_connections: u32,
    pub retries: RetryConfig,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "conveyor".to_string(),
            username: "conveyor".to_string(),
            password: "conveyor".to_string(),
            schema: None,
            max_connections: 10,
            retries: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use serde::{Deserialize, Serialize};
    use std::io::Write;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct ExampleConfig {
        name: String,
        lock_store: RedisConfig,
    }

    impl Default for ExampleConfig {
        fn default() -> Self {
            Self {
                name: "example".to_string(),
                lock_store: RedisConfig::default(),
            }
        }
    }

    #[test]
    fn defaults_load_without_a_config_file() {
        let loader: ConfigLoader<ExampleConfig> =
            ConfigLoader::new(Path::new("/nonexistent/config.toml"));
        let config = loader.load().unwrap();
        check!(config == ExampleConfig::default());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "name = \"from-file\"\n\n[lock_store]\nport = 7000").unwrap();

        let loader: ConfigLoader<ExampleConfig> = ConfigLoader::new(file.path());
        let config = loader.load().unwrap();
        check!(config.name == "from-file");
        check!(config.lock_store.port == 7000);
        check!(config.lock_store.host == "localhost");
    }

    #[test]
    fn redis_url_includes_credentials_when_present() {
        let mut config = RedisConfig::default();
        check!(config.url() == "redis://localhost:6379/0");

        config.password = Some("secret".to_string());
        check!(config.url() == "redis://:secret@localhost:6379/0");
    }
}
