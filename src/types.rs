use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Backend record identifier: numeric or opaque string.
///
/// Batch PATCH/DELETE calls address each record as `{prefix}/{path}/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[serde(untagged)]
pub enum RecordId {
    #[display("{_0}")]
    Int(i64),
    #[display("{_0}")]
    Str(String),
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

/// Authenticated user as returned by `/me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct User {
    pub id: RecordId,
    pub email: String,
    #[serde(default)]
    pub is_root_admin: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub allowed_route_permissions: Option<Vec<RoutePermission>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Role {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub route_permissions: Vec<RoutePermission>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct RoutePermission {
    pub id: RecordId,
    pub is_enabled: bool,
    #[serde(default)]
    pub allowed_users: Option<Vec<IdRef>>,
    #[serde(default)]
    pub methods: Vec<MethodRef>,
    pub route: RouteRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRef {
    pub id: RecordId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRef {
    pub id: RecordId,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRef {
    pub id: RecordId,
    pub path: String,
}

/// Credentials for `POST {prefix}/login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPayload {
    pub email: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remember: Option<bool>,
}

impl LoginPayload {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            remember: None,
        }
    }

    #[must_use]
    pub fn with_remember(mut self, remember: bool) -> Self {
        self.remember = Some(remember);
        self
    }
}

/// Error envelope returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<BackendErrorDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<JsonValue>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}
