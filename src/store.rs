//! Contracts of the external systems the repair core talks to.

use serde_json::{Map, Value};

use crate::{
    error::Result,
    inventory::CredentialSelector,
    model::{CredentialRecord, NewCredentialDocument, Page, PatchOp, PipelineSummary, Project},
};

/// Project, pipeline and flow-template endpoints of the platform.
pub trait PlatformApi: Send + Sync {
    fn list_projects(&self, cursor: Option<&str>) -> Result<Page<Project>>;

    fn get_project(&self, project_id: &str) -> Result<Project>;

    fn find_project_by_name(&self, name: &str) -> Result<Option<Project>>;

    fn list_pipelines(&self, project_id: &str, cursor: Option<&str>)
    -> Result<Page<PipelineSummary>>;

    /// The flow JSON of the pipeline's latest version.
    fn fetch_flow(&self, project_id: &str, pipeline_id: &str) -> Result<Value>;

    /// Upload `flow` as a new (volatile) version of an existing pipeline.
    fn upload_pipeline_version(
        &self,
        project_id: &str,
        pipeline_id: &str,
        name: &str,
        flow: &Value,
    ) -> Result<()>;
}

/// Direct document-level access to the credential database.
pub trait CredentialStore: Send + Sync {
    /// One page of records matching `selector`. `bookmark` continues a previous page.
    fn find(
        &self,
        selector: &CredentialSelector,
        limit: usize,
        bookmark: Option<&str>,
    ) -> Result<CredentialPage>;

    fn get(&self, id: &str) -> Result<Option<CredentialRecord>>;

    /// Insert a new document and return its id.
    fn insert(&self, doc: &NewCredentialDocument) -> Result<String>;

    /// Replace the whole document (the record's revision must be current).
    fn put(&self, record: &CredentialRecord) -> Result<()>;

    fn delete(&self, record: &CredentialRecord) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialPage {
    pub docs: Vec<CredentialRecord>,
    pub bookmark: Option<String>,
}

/// The platform's credential API, which encrypts secret payloads on write.
pub trait CredentialApi: Send + Sync {
    /// Apply JSON-patch operations to a record; secret values are encrypted server side.
    fn patch(&self, id: &str, ops: &[PatchOp]) -> Result<()>;
}

/// Vault endpoints for generic secrets.
pub trait SecretVault: Send + Sync {
    /// Create a generic secret and return its urn.
    fn create_secret(&self, name: &str, generic: &Map<String, Value>) -> Result<String>;

    /// Read the generic payload behind a credential record on behalf of the record's
    /// owner. `None` when the secret cannot be read with the available authority.
    fn read_record_secret(&self, record: &CredentialRecord) -> Result<Option<Map<String, Value>>>;
}
