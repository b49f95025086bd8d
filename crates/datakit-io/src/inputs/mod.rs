// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector plugins.
//!
//! Inputs are registered explicitly by the composition root; nothing registers itself
//! at load time. An input only sees the [`Io`] handle it feeds into.

pub mod self_stats;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::io::Io;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("input '{0}' is already registered")]
    Duplicate(String),
    #[error("unknown input '{0}'")]
    Unknown(String),
}

#[async_trait]
pub trait Input: Send + Sync {
    fn name(&self) -> &str;

    /// Collects until `cancel` fires.
    async fn run(&self, io: Io, cancel: CancellationToken);
}

pub type InputCreator = Box<dyn Fn(&Config) -> Box<dyn Input> + Send + Sync>;

#[derive(Default)]
pub struct InputRegistry {
    creators: BTreeMap<String, InputCreator>,
}

impl fmt::Debug for InputRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputRegistry")
            .field("inputs", &self.creators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InputRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the inputs shipped with this crate.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.creators.insert(
            self_stats::NAME.to_string(),
            Box::new(|config| Box::new(self_stats::SelfInput::from_config(config))),
        );
        registry
    }

    pub fn add_creator(
        &mut self,
        name: impl Into<String>,
        creator: InputCreator,
    ) -> Result<(), InputError> {
        let name = name.into();
        if self.creators.contains_key(&name) {
            return Err(InputError::Duplicate(name));
        }
        self.creators.insert(name, creator);
        Ok(())
    }

    pub fn create(&self, name: &str, config: &Config) -> Result<Box<dyn Input>, InputError> {
        self.creators
            .get(name)
            .map(|creator| creator(config))
            .ok_or_else(|| InputError::Unknown(name.to_string()))
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.creators.keys().map(String::as_str).collect()
    }

    /// Spawns every input named in `config.inputs`. Unknown names are logged and
    /// skipped.
    pub fn start(&self, config: &Config, io: &Io, cancel: &CancellationToken) -> JoinSet<()> {
        let mut running = JoinSet::new();
        for name in &config.inputs {
            match self.create(name, config) {
                Ok(input) => {
                    info!("INPUT | starting {}", input.name());
                    let io = io.clone();
                    let cancel = cancel.clone();
                    running.spawn(async move { input.run(io, cancel).await });
                }
                Err(e) => error!("INPUT | {}", e),
            }
        }
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(String);

    #[async_trait]
    impl Input for Noop {
        fn name(&self) -> &str {
            &self.0
        }

        async fn run(&self, _io: Io, cancel: CancellationToken) {
            cancel.cancelled().await;
        }
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = InputRegistry::with_builtin();
        let err = registry
            .add_creator(
                self_stats::NAME,
                Box::new(|_| Box::new(Noop("again".to_string()))),
            )
            .expect_err("duplicate");
        assert_eq!(err, InputError::Duplicate("self".to_string()));

        registry
            .add_creator("noop", Box::new(|_| Box::new(Noop("noop".to_string()))))
            .expect("new name");
        assert_eq!(registry.names(), vec!["noop", "self"]);
    }

    #[test]
    fn test_create_unknown_input() {
        let registry = InputRegistry::new();
        assert!(matches!(
            registry.create("mysql", &Config::default()),
            Err(InputError::Unknown(name)) if name == "mysql"
        ));
    }
}
