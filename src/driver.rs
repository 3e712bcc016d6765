//! # Data-Source Drivers
//!
//! Per-(entity, source) CRUD over a document, the runtime driver registry,
//! and the default shell-command driver.

use crate::document::Document;
use crate::model::ForeignKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

/// Failures a driver can report. `NotFound` is recoverable inside a cycle;
/// `Unavailable` triggers retry with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("record not found")]
    NotFound,
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// CRUD over one source's copy of an entity's records.
///
/// `open` and `close` are lifecycle hooks: the registry opens drivers in
/// declared order and closes them in reverse.
#[async_trait]
pub trait SourceDriver: Send + Sync {
    async fn open(&self, _config: &HashMap<String, String>) -> Result<(), DriverError> {
        Ok(())
    }

    /// Fetch the current document for a foreign key.
    async fn get(&self, fk: &ForeignKey) -> Result<Document, DriverError>;

    /// Upsert. With no foreign key the source mints and returns a new one;
    /// idempotency is not required, callers avoid duplicate creates.
    async fn set(&self, doc: &Document, fk: Option<&ForeignKey>)
        -> Result<ForeignKey, DriverError>;

    /// Remove. A missing foreign key is treated as success.
    async fn delete(&self, fk: &ForeignKey) -> Result<(), DriverError>;

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct Registration {
    entity: String,
    source: String,
    config: HashMap<String, String>,
    driver: Arc<dyn SourceDriver>,
}

/// Runtime mapping from (entity, source) to a driver instance.
///
/// Entity declaration is data, not code: entities and their source lists are
/// whatever was registered at startup, in registration order.
#[derive(Default)]
pub struct DriverRegistry {
    registrations: Vec<Registration>,
    drivers: HashMap<(String, String), Arc<dyn SourceDriver>>,
    entities: Vec<String>,
    sources: HashMap<String, Vec<String>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver for one (entity, source) pair with its
    /// configuration bag. Registration order fixes lifecycle order.
    pub fn register(
        &mut self,
        entity: impl Into<String>,
        source: impl Into<String>,
        config: HashMap<String, String>,
        driver: Arc<dyn SourceDriver>,
    ) {
        let entity = entity.into();
        let source = source.into();
        self.drivers
            .insert((entity.clone(), source.clone()), driver.clone());
        if !self.entities.contains(&entity) {
            self.entities.push(entity.clone());
        }
        let declared = self.sources.entry(entity.clone()).or_default();
        if !declared.contains(&source) {
            declared.push(source.clone());
        }
        self.registrations.push(Registration {
            entity,
            source,
            config,
            driver,
        });
    }

    pub fn contains_entity(&self, entity: &str) -> bool {
        self.sources.contains_key(entity)
    }

    /// Declared sources of an entity, in declaration order.
    pub fn sources(&self, entity: &str) -> Option<&[String]> {
        self.sources.get(entity).map(Vec::as_slice)
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn driver(&self, entity: &str, source: &str) -> Option<Arc<dyn SourceDriver>> {
        self.drivers
            .get(&(entity.to_string(), source.to_string()))
            .cloned()
    }

    /// Open every driver in declared order, stopping at the first failure.
    pub async fn open_all(&self) -> Result<(), DriverError> {
        for reg in &self.registrations {
            reg.driver.open(&reg.config).await?;
        }
        Ok(())
    }

    /// Close every driver in reverse declared order. Failures are logged,
    /// not propagated; shutdown keeps going.
    pub async fn close_all(&self) {
        for reg in self.registrations.iter().rev() {
            if let Err(err) = reg.driver.close().await {
                warn!(entity = %reg.entity, source = %reg.source, %err, "driver close failed");
            }
        }
    }
}

/// Command templates for one source; `%fk` expands to the foreign key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellCommands {
    pub create: Option<String>,
    pub read: Option<String>,
    pub update: Option<String>,
    pub delete: Option<String>,
}

/// Exit status a shell command uses to signal a missing record.
const NOT_FOUND_STATUS: i32 = 4;

/// The default driver: each verb runs a configured shell command. Documents
/// travel as JSON on stdin/stdout; `create` prints the minted foreign key.
pub struct ShellDriver {
    commands: ShellCommands,
}

impl ShellDriver {
    pub fn new(commands: ShellCommands) -> Self {
        Self { commands }
    }

    fn command_for(&self, verb: &str) -> Result<&str, DriverError> {
        let template = match verb {
            "create" => &self.commands.create,
            "read" => &self.commands.read,
            "update" => &self.commands.update,
            "delete" => &self.commands.delete,
            _ => &None,
        };
        template
            .as_deref()
            .ok_or_else(|| DriverError::Unavailable(format!("no {verb} command configured")))
    }

    async fn run(
        &self,
        verb: &str,
        fk: Option<&ForeignKey>,
        stdin: Option<String>,
    ) -> Result<String, DriverError> {
        let template = self.command_for(verb)?;
        let command_line = match fk {
            Some(fk) => template.replace("%fk", fk.as_str()),
            None => template.to_string(),
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|err| DriverError::Unavailable(format!("spawn failed: {err}")))?;

        if let Some(payload) = stdin {
            let mut handle = child.stdin.take().expect("stdin is piped");
            handle
                .write_all(payload.as_bytes())
                .await
                .map_err(|err| DriverError::Unavailable(format!("stdin write failed: {err}")))?;
        } else {
            drop(child.stdin.take());
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| DriverError::Unavailable(format!("wait failed: {err}")))?;

        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(NOT_FOUND_STATUS) => Err(DriverError::NotFound),
            status => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(DriverError::Unavailable(format!(
                    "command exited with {status:?}: {}",
                    stderr.trim()
                )))
            }
        }
    }
}

#[async_trait]
impl SourceDriver for ShellDriver {
    async fn get(&self, fk: &ForeignKey) -> Result<Document, DriverError> {
        let stdout = self.run("read", Some(fk), None).await?;
        Document::from_json_str(&stdout)
            .map_err(|err| DriverError::Unavailable(format!("bad document from read: {err}")))
    }

    async fn set(
        &self,
        doc: &Document,
        fk: Option<&ForeignKey>,
    ) -> Result<ForeignKey, DriverError> {
        let payload = doc
            .to_json_string()
            .map_err(|err| DriverError::Unavailable(format!("unencodable document: {err}")))?;
        match fk {
            Some(fk) => {
                self.run("update", Some(fk), Some(payload)).await?;
                Ok(fk.clone())
            }
            None => {
                let stdout = self.run("create", None, Some(payload)).await?;
                let minted = stdout.trim();
                if minted.is_empty() {
                    return Err(DriverError::Unavailable(
                        "create printed no foreign key".to_string(),
                    ));
                }
                Ok(ForeignKey::new(minted))
            }
        }
    }

    async fn delete(&self, fk: &ForeignKey) -> Result<(), DriverError> {
        match self.run("delete", Some(fk), None).await {
            Ok(_) => Ok(()),
            Err(DriverError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
