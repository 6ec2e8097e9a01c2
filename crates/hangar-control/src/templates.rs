// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Machine templates.
//!
//! A template is a named starting point for machine creation. The request
//! is merged over it: request image wins, env maps merge with request keys
//! winning, non-empty request tools replace template tools, and set request
//! resource fields override template fields.
//!
//! Three templates are built in. Edits live in memory only and are lost on
//! restart.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::machine::{MachineRequest, Resources};
use crate::store::Store;

/// A named machine starting point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Template name.
    #[serde(default)]
    pub name: String,
    /// Human readable description.
    #[serde(default)]
    pub description: String,
    /// Container image.
    pub image: String,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Auxiliary capabilities.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Resource ceilings.
    #[serde(default)]
    pub resources: Resources,
}

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn resources(cpu: &str, memory: &str, disk: &str) -> Resources {
    Resources {
        cpu: Some(cpu.to_string()),
        memory: Some(memory.to_string()),
        disk: Some(disk.to_string()),
    }
}

/// The built-in templates.
pub fn builtin_templates() -> Vec<Template> {
    vec![
        Template {
            name: "desktop".to_string(),
            description: "Linux desktop reachable over VNC".to_string(),
            image: "hangar/desktop:latest".to_string(),
            env: env(&[("DISPLAY", ":1"), ("RESOLUTION", "1920x1080")]),
            tools: vec!["vnc".to_string()],
            resources: resources("2", "4Gi", "20Gi"),
        },
        Template {
            name: "browser".to_string(),
            description: "Headless Chromium with the DevTools protocol".to_string(),
            image: "hangar/browser:latest".to_string(),
            env: env(&[("CDP_PORT", "9222")]),
            tools: vec!["cdp".to_string()],
            resources: resources("1", "2Gi", "5Gi"),
        },
        Template {
            name: "streaming".to_string(),
            description: "RTMP ingest and transcoding".to_string(),
            image: "hangar/streaming:latest".to_string(),
            env: env(&[("RTMP_PORT", "1935")]),
            tools: vec!["rtmp".to_string()],
            resources: resources("2", "4Gi", "10Gi"),
        },
    ]
}

/// Templates keyed by name.
pub type TemplateStore = Store<String, Template>;

/// A template store holding the built-in templates.
pub fn default_templates() -> TemplateStore {
    Store::with_entries(builtin_templates().into_iter().map(|t| (t.name.clone(), t)))
}

/// Everything needed to create a machine after template merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
    /// Container image.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Auxiliary capabilities.
    pub tools: Vec<String>,
    /// Resource ceilings, possibly still partially unset.
    pub resources: Resources,
}

/// Merge a creation request over an optional template.
pub fn merge(request: &MachineRequest, template: Option<&Template>) -> Result<Blueprint> {
    let requested_image = request
        .image
        .as_deref()
        .map(str::trim)
        .filter(|image| !image.is_empty());

    let Some(template) = template else {
        let image = requested_image
            .ok_or_else(|| Error::InvalidRequest("image or template is required".to_string()))?;
        return Ok(Blueprint {
            image: image.to_string(),
            env: request.env.clone(),
            tools: request.tools.clone(),
            resources: request.resources.clone(),
        });
    };

    let mut env = template.env.clone();
    env.extend(request.env.clone());

    let tools = if request.tools.is_empty() {
        template.tools.clone()
    } else {
        request.tools.clone()
    };

    Ok(Blueprint {
        image: requested_image.unwrap_or(template.image.as_str()).to_string(),
        env,
        tools,
        resources: request.resources.over(&template.resources),
    })
}

/// Template lookup and administration.
#[derive(Clone)]
pub struct TemplateCatalog {
    templates: TemplateStore,
}

impl TemplateCatalog {
    /// Create a catalog over `templates`.
    pub fn new(templates: TemplateStore) -> Self {
        Self { templates }
    }

    /// Look up a template by name.
    pub async fn get(&self, name: &str) -> Result<Template> {
        self.templates
            .get(&name.to_string())
            .await
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))
    }

    /// Every template, sorted by name.
    pub async fn list(&self) -> Vec<Template> {
        let mut templates = self.templates.list().await;
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    /// Create or replace a template.
    pub async fn set(&self, template: Template) -> Result<Template> {
        if template.name.trim().is_empty() {
            return Err(Error::InvalidRequest("template name is required".to_string()));
        }
        if template.image.trim().is_empty() {
            return Err(Error::InvalidRequest("template image is required".to_string()));
        }
        info!(template = %template.name, image = %template.image, "Template set");
        self.templates
            .set(template.name.clone(), template.clone())
            .await;
        Ok(template)
    }

    /// Remove a template.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.templates.delete(&name.to_string()).await {
            Some(_) => {
                info!(template = %name, "Template deleted");
                Ok(())
            }
            None => Err(Error::TemplateNotFound(name.to_string())),
        }
    }

    /// Merge `request` over its named template, if any.
    pub async fn resolve(&self, request: &MachineRequest) -> Result<Blueprint> {
        match request.template.as_deref().filter(|t| !t.is_empty()) {
            Some(name) => {
                let template = self.get(name).await?;
                merge(request, Some(&template))
            }
            None => merge(request, None),
        }
    }
}
