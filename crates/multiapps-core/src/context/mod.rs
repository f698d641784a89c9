// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process context: the typed variable store shared by the steps of one process.
//!
//! Values are kept as JSON so that a context can be flushed to
//! [`Persistence`] after every invocation and loaded again on another worker.
//! Nothing else survives between invocations.

pub mod variables;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use multiapps_platform::{ClientFactory, CloudTarget, PlatformClient};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::persistence::{Persistence, VariableChange};
use crate::step::StepLogger;

/// Typed key of a process variable.
pub struct Variable<T> {
    name: &'static str,
    default: Option<fn() -> T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Variable<T> {
    /// A variable without a default: absent reads yield `None`.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            default: None,
            _marker: PhantomData,
        }
    }

    /// A variable whose absent reads yield `default()`.
    pub const fn with_default(name: &'static str, default: fn() -> T) -> Self {
        Self {
            name,
            default: Some(default),
            _marker: PhantomData,
        }
    }

    /// Persisted name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Variable<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Variable<T> {}

impl<T> fmt::Debug for Variable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Variable store and collaborator handles of one process instance.
pub struct ProcessContext {
    process_id: String,
    values: HashMap<String, Value>,
    changes: HashMap<String, Option<Value>>,
    persistence: Arc<dyn Persistence>,
    factory: Arc<dyn ClientFactory>,
    clients: HashMap<CloudTarget, Arc<dyn PlatformClient>>,
    fail_safe_default: bool,
    logger: StepLogger,
}

impl ProcessContext {
    /// Create an empty context. Nothing is read from persistence.
    pub fn new(
        process_id: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let process_id = process_id.into();
        Self {
            logger: StepLogger::new(process_id.clone()),
            process_id,
            values: HashMap::new(),
            changes: HashMap::new(),
            persistence,
            factory,
            clients: HashMap::new(),
            fail_safe_default: false,
        }
    }

    /// Load the persisted variables of `process_id`.
    pub async fn load(
        process_id: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        let mut context = Self::new(process_id, persistence, factory);
        let records = context.persistence.load_variables(&context.process_id).await?;
        for record in records {
            let value: Value =
                serde_json::from_str(&record.value).map_err(|e| CoreError::Variable {
                    name: record.name.clone(),
                    details: e.to_string(),
                })?;
            context.values.insert(record.name, value);
        }
        debug!(
            process_id = %context.process_id,
            variables = context.values.len(),
            "Loaded process context"
        );
        Ok(context)
    }

    /// Fail-safe setting used when the process does not set
    /// `NO_FAIL_ON_MISSING_PERMISSIONS`.
    pub fn with_fail_safe_default(mut self, fail_safe: bool) -> Self {
        self.fail_safe_default = fail_safe;
        self
    }

    /// Owning process instance.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Persistence backing this context.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Whether permission failures are tolerated in this process.
    pub fn fail_safe(&self) -> Result<bool> {
        Ok(self
            .get(variables::NO_FAIL_ON_MISSING_PERMISSIONS)?
            .unwrap_or(self.fail_safe_default))
    }

    /// Logger of the current invocation.
    pub fn logger(&mut self) -> &mut StepLogger {
        &mut self.logger
    }

    /// Read a variable, falling back to its declared default.
    pub fn get<T: DeserializeOwned>(&self, variable: Variable<T>) -> Result<Option<T>> {
        match self.values.get(variable.name) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| CoreError::Variable {
                    name: variable.name.to_string(),
                    details: e.to_string(),
                }),
            None => Ok(variable.default.map(|default| default())),
        }
    }

    /// Read a variable that must be set or have a default.
    pub fn require<T: DeserializeOwned>(&self, variable: Variable<T>) -> Result<T> {
        self.get(variable)?.ok_or_else(|| CoreError::Variable {
            name: variable.name.to_string(),
            details: "not set".to_string(),
        })
    }

    /// Whether the variable holds a stored value.
    pub fn contains<T>(&self, variable: Variable<T>) -> bool {
        self.values.contains_key(variable.name)
    }

    /// Write a variable.
    pub fn set<T: Serialize>(&mut self, variable: Variable<T>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| CoreError::Variable {
            name: variable.name.to_string(),
            details: e.to_string(),
        })?;
        self.values.insert(variable.name.to_string(), value.clone());
        self.changes.insert(variable.name.to_string(), Some(value));
        Ok(())
    }

    /// Remove a variable; later reads yield its default.
    pub fn remove<T>(&mut self, variable: Variable<T>) {
        if self.values.remove(variable.name).is_some() || variable.default.is_some() {
            self.changes.insert(variable.name.to_string(), None);
        }
    }

    /// Whether there are changes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        !self.changes.is_empty() || !self.logger.pending().is_empty()
    }

    /// Write pending changes and logged warnings to persistence.
    pub async fn flush(&mut self) -> Result<()> {
        let pending = self.logger.take_pending();
        if !pending.is_empty() {
            let mut warnings = self.require(variables::STEP_WARNINGS)?;
            warnings.extend(pending);
            self.set(variables::STEP_WARNINGS, &warnings)?;
        }
        if self.changes.is_empty() {
            return Ok(());
        }

        let mut changes: Vec<VariableChange> = Vec::with_capacity(self.changes.len());
        for (name, value) in self.changes.drain() {
            let value = value.map(|v| serde_json::to_string(&v)).transpose()?;
            changes.push((name, value));
        }
        changes.sort_by(|a, b| a.0.cmp(&b.0));

        self.persistence
            .save_variables(&self.process_id, &changes)
            .await?;
        debug!(
            process_id = %self.process_id,
            changes = changes.len(),
            "Flushed process context"
        );
        Ok(())
    }

    /// Client for the process's own target (`USER`, `ORG`, `SPACE`).
    pub async fn client(&mut self) -> Result<Arc<dyn PlatformClient>> {
        let target = CloudTarget::new(
            self.require(variables::USER)?,
            self.require(variables::ORG)?,
            self.require(variables::SPACE)?,
        );
        self.client_for(&target).await
    }

    /// Client for `target`, authenticated once per context.
    pub async fn client_for(&mut self, target: &CloudTarget) -> Result<Arc<dyn PlatformClient>> {
        if let Some(client) = self.clients.get(target) {
            return Ok(client.clone());
        }
        let client = self.factory.create_client(target).await?;
        self.clients.insert(target.clone(), client.clone());
        Ok(client)
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("process_id", &self.process_id)
            .field("variables", &self.values.len())
            .field("pending_changes", &self.changes.len())
            .finish()
    }
}
