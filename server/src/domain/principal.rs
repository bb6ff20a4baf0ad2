//! Authenticated principal
//!
//! Identity verification lives outside the event plane; every operation
//! consumes an already-resolved principal.

use serde::{Deserialize, Serialize};

/// The already-authenticated identity consumed at the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub tenant_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn new(user_id: &str, tenant_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: None,
            tenant_id: tenant_id.to_string(),
            permissions: Vec::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }
}
