// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{QuorumError, Result};

pub const RECAP_URI_PREFIX: &str = "urn:recap:";
pub const WILDCARD: &str = "*";

/// One requested `(protocol, resourceId)` pair, written `protocol://resourceId`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub protocol: String,
    pub resource_id: String,
}

impl ResourceRequest {
    pub fn new(protocol: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            resource_id: resource_id.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.resource_id == WILDCARD
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.resource_id)
    }
}

impl FromStr for ResourceRequest {
    type Err = QuorumError;

    fn from_str(s: &str) -> Result<Self> {
        let (protocol, resource_id) = s
            .split_once("://")
            .ok_or_else(|| QuorumError::Capability(format!("resource without protocol: {s}")))?;
        if protocol.is_empty() || resource_id.is_empty() {
            return Err(QuorumError::Capability(format!("incomplete resource: {s}")));
        }
        Ok(Self::new(protocol, resource_id))
    }
}

/// A delegation grant. Sets and maps are ordered so the encoded token is
/// identical for identical grants.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityObject {
    #[serde(rename = "def", default)]
    default_actions: BTreeSet<String>,
    #[serde(rename = "tar", default)]
    per_resource_actions: BTreeMap<String, BTreeSet<String>>,
}

fn grants(actions: &BTreeSet<String>, protocol: &str) -> bool {
    actions.contains(protocol) || actions.contains(WILDCARD)
}

impl CapabilityObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant covering exactly the requested pairs.
    pub fn for_resources(resources: &[ResourceRequest]) -> Self {
        let mut capability = Self::new();
        for resource in resources {
            capability.add_resource_action(&resource.resource_id, &resource.protocol);
        }
        capability
    }

    pub fn with_default_action(mut self, action: impl Into<String>) -> Self {
        self.default_actions.insert(action.into());
        self
    }

    pub fn add_resource_action(&mut self, resource_id: &str, action: &str) {
        self.per_resource_actions
            .entry(resource_id.to_string())
            .or_default()
            .insert(action.to_string());
    }

    pub fn revoke_resource_action(&mut self, resource_id: &str, action: &str) {
        if let Some(actions) = self.per_resource_actions.get_mut(resource_id) {
            actions.remove(action);
            if actions.is_empty() {
                self.per_resource_actions.remove(resource_id);
            }
        }
    }

    pub fn revoke_default_action(&mut self, action: &str) {
        self.default_actions.remove(action);
    }

    pub fn default_actions(&self) -> impl Iterator<Item = &str> {
        self.default_actions.iter().map(String::as_str)
    }

    pub fn resource_actions(&self, resource_id: &str) -> impl Iterator<Item = &str> {
        self.per_resource_actions
            .get(resource_id)
            .into_iter()
            .flat_map(|actions| actions.iter().map(String::as_str))
    }

    /// A wildcard request is only covered by a default action or a `*` resource entry.
    pub fn covers(&self, request: &ResourceRequest) -> bool {
        if grants(&self.default_actions, &request.protocol) {
            return true;
        }
        if let Some(actions) = self.per_resource_actions.get(WILDCARD) {
            if grants(actions, &request.protocol) {
                return true;
            }
        }
        self.per_resource_actions
            .get(&request.resource_id)
            .is_some_and(|actions| grants(actions, &request.protocol))
    }

    pub fn uncovered(&self, requests: &[ResourceRequest]) -> Vec<ResourceRequest> {
        requests
            .iter()
            .filter(|r| !self.covers(r))
            .cloned()
            .collect()
    }

    pub fn to_uri(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{RECAP_URI_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        let encoded = uri
            .strip_prefix(RECAP_URI_PREFIX)
            .ok_or_else(|| QuorumError::Capability(format!("not a recap URI: {uri}")))?;
        let json = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| QuorumError::Capability(format!("invalid recap encoding: {e}")))?;
        let capability: Self = serde_json::from_slice(&json)
            .map_err(|e| QuorumError::Capability(format!("invalid recap body: {e}")))?;

        let empty_action = capability.default_actions.iter().any(String::is_empty)
            || capability
                .per_resource_actions
                .iter()
                .any(|(id, actions)| id.is_empty() || actions.iter().any(String::is_empty));
        if empty_action {
            return Err(QuorumError::Capability("empty action or resource id".into()));
        }
        Ok(capability)
    }

    /// Finds the recap among a signed message's resource URIs.
    pub fn from_resources<'a>(resources: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        resources
            .into_iter()
            .find(|r| r.starts_with(RECAP_URI_PREFIX))
            .ok_or_else(|| QuorumError::Capability("signed message carries no recap".into()))
            .and_then(Self::from_uri)
    }
}
