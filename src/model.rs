use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Project id written into the scope of a voided credential record. No real project uses it.
pub const VOID_PROJECT_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Credential type used for pipeline parameter bindings.
pub const PARAMETERS_TYPE: &str = "parameters";

/// Asset id of the record that owns the shared placeholder secret. Never a pipeline.
pub const HELPER_ASSET_ID: &str = "migration_helper";

/// Storage type of projects backed by git; their pipelines live outside the platform store.
pub const GIT_STORAGE_TYPE: &str = "local_git_storage";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl CredentialScope {
    pub fn for_asset(asset_id: impl Into<String>) -> Self {
        CredentialScope {
            asset_id: Some(asset_id.into()),
            ..Default::default()
        }
    }

    pub fn for_project(asset_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        CredentialScope {
            asset_id: Some(asset_id.into()),
            project_id: Some(project_id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialOwner {
    #[serde(default)]
    pub user_id: String,
}

/// One secret-binding document as held by the credential store.
///
/// Unknown fields are carried through `extra` so that a full-document replacement never
/// drops data the store owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(rename = "_id", alias = "id", default)]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub secret_id: String,
    #[serde(default)]
    pub owner: CredentialOwner,
    #[serde(default)]
    pub scope: CredentialScope,
    #[serde(rename = "type", default)]
    pub credential_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl CredentialRecord {
    pub fn asset_id(&self) -> Option<&str> {
        self.scope.asset_id.as_deref()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.scope.project_id.as_deref()
    }

    pub fn is_unscoped(&self) -> bool {
        self.scope.project_id.is_none()
    }

    pub fn is_voided(&self) -> bool {
        self.project_id() == Some(VOID_PROJECT_ID)
    }

    /// `updated_at`, falling back to `created_at`.
    pub fn timestamp(&self) -> Option<&str> {
        self.updated_at.as_deref().or(self.created_at.as_deref())
    }

    /// The owner id encoded as the prefix of a vault secret urn (`<owner>:<name>`).
    pub fn secret_owner_id(&self) -> Option<&str> {
        self.secret_id
            .split_once(':')
            .map(|(owner, _)| owner)
            .filter(|owner| !owner.is_empty())
    }
}

/// Document inserted directly into the credential store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewCredentialDocument {
    pub created_at: String,
    pub creator_id: String,
    pub name: String,
    pub owner: CredentialOwner,
    pub scope: CredentialScope,
    pub secret_id: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    pub updated_at: String,
}

/// A single JSON-patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    pub value: Value,
}

impl PatchOp {
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        PatchOp {
            op: "replace".to_string(),
            path: path.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub storage_type: String,
}

impl Project {
    pub fn is_git_based(&self) -> bool {
        self.storage_type == GIT_STORAGE_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: String,
    pub name: String,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Page { items, next: None }
    }
}
