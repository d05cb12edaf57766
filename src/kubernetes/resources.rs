// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Resource kinds the resource group can track by name
//!
//! Lets configuration and the command line refer to kinds as `configmaps`,
//! `secret`, `cm` and so on.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::reflector::Store;

use super::ApiFilters;
use super::client::Client;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedKind {
    ConfigMaps,
    Secrets,
}

impl TrackedKind {
    pub fn all() -> &'static [TrackedKind] {
        &[TrackedKind::ConfigMaps, TrackedKind::Secrets]
    }

    /// Canonical plural name
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigMaps => "configmaps",
            Self::Secrets => "secrets",
        }
    }

    /// Register this kind in the client's resource group
    pub fn watch(&self, client: &mut Client, filters: ApiFilters) -> Result<TrackedStore> {
        let store = match self {
            Self::ConfigMaps => TrackedStore::ConfigMaps(client.watch_resource(filters)?),
            Self::Secrets => TrackedStore::Secrets(client.watch_resource(filters)?),
        };
        Ok(store)
    }
}

impl fmt::Display for TrackedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrackedKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "configmaps" | "configmap" | "cm" => Ok(Self::ConfigMaps),
            "secrets" | "secret" => Ok(Self::Secrets),
            other => Err(anyhow!(
                "Unsupported resource kind '{}'. Supported: {}",
                other,
                TrackedKind::all()
                    .iter()
                    .map(|k| k.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

/// Read handle of a tracked kind's cache
#[derive(Clone)]
pub enum TrackedStore {
    ConfigMaps(Store<ConfigMap>),
    Secrets(Store<Secret>),
}

impl TrackedStore {
    pub fn kind(&self) -> TrackedKind {
        match self {
            Self::ConfigMaps(_) => TrackedKind::ConfigMaps,
            Self::Secrets(_) => TrackedKind::Secrets,
        }
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        match self {
            Self::ConfigMaps(store) => store.state().len(),
            Self::Secrets(store) => store.state().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse a comma-separated list of kinds, dropping duplicates
pub fn parse_kinds(list: &str) -> Result<Vec<TrackedKind>> {
    let mut kinds = Vec::new();
    for part in list.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let kind: TrackedKind = part.parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}
