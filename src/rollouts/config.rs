/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::rollouts::logger::LogFormat;
use crate::rollouts::util::error::{new_error, with_context};
use std::env;
use std::error::Error;
use std::time::Duration;

/// Enum for supported configuration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    Namespace,
    RolloutThreads,
    IngressThreads,
    QueueBaseDelayMs,
    QueueMaxDelayMs,
    LogFormat,
    WatchBackoffMaxMs,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Namespace => "ROLLOUTS_NAMESPACE",
            Config::RolloutThreads => "ROLLOUTS_ROLLOUT_THREADS",
            Config::IngressThreads => "ROLLOUTS_INGRESS_THREADS",
            Config::QueueBaseDelayMs => "ROLLOUTS_QUEUE_BASE_DELAY_MS",
            Config::QueueMaxDelayMs => "ROLLOUTS_QUEUE_MAX_DELAY_MS",
            Config::LogFormat => "ROLLOUTS_LOG_FORMAT",
            Config::WatchBackoffMaxMs => "ROLLOUTS_WATCH_BACKOFF_MAX_MS",
        }
    }

    /// Default used when the environment variable is unset. An empty
    /// namespace means every namespace is watched.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Namespace => "",
            Config::RolloutThreads => "10",
            Config::IngressThreads => "10",
            Config::QueueBaseDelayMs => "5",
            Config::QueueMaxDelayMs => "1000000",
            Config::LogFormat => "text",
            Config::WatchBackoffMaxMs => "10000",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> String {
        env::var(self.env_var()).unwrap_or_else(|_| self.default_value().to_string())
    }

    fn get_u64(&self) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let raw = self.get();
        raw.trim()
            .parse::<u64>()
            .map_err(|err| with_context(err, format!("{}={:?}", self.env_var(), raw)))
    }
}

/// Resolved controller parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub namespace: Option<String>,
    pub rollout_threads: usize,
    pub ingress_threads: usize,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
    pub log_format: LogFormat,
    pub watch_backoff_max: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            rollout_threads: 10,
            ingress_threads: 10,
            queue_base_delay: Duration::from_millis(5),
            queue_max_delay: Duration::from_secs(1000),
            log_format: LogFormat::Text,
            watch_backoff_max: Duration::from_millis(10_000),
        }
    }
}

impl ControllerSettings {
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let namespace = Some(Config::Namespace.get().trim().to_string()).filter(|ns| !ns.is_empty());
        let raw_format = Config::LogFormat.get();
        let log_format = LogFormat::parse(&raw_format).ok_or_else(|| {
            new_error(format!(
                "{}={:?}: expected `text` or `json`",
                Config::LogFormat.env_var(),
                raw_format
            ))
        })?;

        let settings = Self {
            namespace,
            rollout_threads: Config::RolloutThreads.get_u64()? as usize,
            ingress_threads: Config::IngressThreads.get_u64()? as usize,
            queue_base_delay: Duration::from_millis(Config::QueueBaseDelayMs.get_u64()?),
            queue_max_delay: Duration::from_millis(Config::QueueMaxDelayMs.get_u64()?),
            log_format,
            watch_backoff_max: Duration::from_millis(Config::WatchBackoffMaxMs.get_u64()?),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.rollout_threads == 0 {
            return Err(new_error(format!(
                "{} must be at least 1",
                Config::RolloutThreads.env_var()
            )));
        }
        if self.ingress_threads == 0 {
            return Err(new_error(format!(
                "{} must be at least 1",
                Config::IngressThreads.env_var()
            )));
        }
        if self.queue_base_delay > self.queue_max_delay {
            return Err(new_error(format!(
                "{} must not exceed {}",
                Config::QueueBaseDelayMs.env_var(),
                Config::QueueMaxDelayMs.env_var()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL: [Config; 7] = [
        Config::Namespace,
        Config::RolloutThreads,
        Config::IngressThreads,
        Config::QueueBaseDelayMs,
        Config::QueueMaxDelayMs,
        Config::LogFormat,
        Config::WatchBackoffMaxMs,
    ];

    fn clear_env() {
        for config in ALL {
            env::remove_var(config.env_var());
        }
    }

    #[test]
    #[serial]
    fn defaults_match_settings_default() {
        clear_env();
        let settings = ControllerSettings::from_env().expect("default settings");
        assert_eq!(settings, ControllerSettings::default());
    }

    #[test]
    #[serial]
    fn environment_overrides_defaults() {
        clear_env();
        env::set_var("ROLLOUTS_NAMESPACE", "prod");
        env::set_var("ROLLOUTS_ROLLOUT_THREADS", "4");
        env::set_var("ROLLOUTS_LOG_FORMAT", "json");
        env::set_var("ROLLOUTS_QUEUE_MAX_DELAY_MS", "2000");
        let settings = ControllerSettings::from_env().expect("settings");
        clear_env();

        assert_eq!(settings.namespace.as_deref(), Some("prod"));
        assert_eq!(settings.rollout_threads, 4);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.queue_max_delay, Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn invalid_values_are_rejected() {
        clear_env();
        env::set_var("ROLLOUTS_INGRESS_THREADS", "many");
        let err = ControllerSettings::from_env().expect_err("non-numeric threads");
        assert!(err.to_string().contains("ROLLOUTS_INGRESS_THREADS"));

        env::set_var("ROLLOUTS_INGRESS_THREADS", "0");
        assert!(ControllerSettings::from_env().is_err());

        env::remove_var("ROLLOUTS_INGRESS_THREADS");
        env::set_var("ROLLOUTS_LOG_FORMAT", "xml");
        assert!(ControllerSettings::from_env().is_err());
        clear_env();
    }
}
