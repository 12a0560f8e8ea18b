//! In-memory collaborators. They behave like the real services closely enough for
//! tests and offline runs: cursors, revisions, not-found and injected write failures.

use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::{
    error::{RepairError, Result},
    inventory::CredentialSelector,
    model::{CredentialRecord, NewCredentialDocument, Page, PatchOp, PipelineSummary, Project},
    store::{CredentialApi, CredentialPage, CredentialStore, PlatformApi, SecretVault},
};

/// Owner prefix of secrets created by [`MemoryCredentialStore`].
pub const MEMORY_SECRET_OWNER: &str = "1000331001";

#[derive(Debug, Default)]
struct StoreState {
    docs: Vec<CredentialRecord>,
    next_id: u64,
    secrets: IndexMap<String, Map<String, Value>>,
    patches: Vec<(String, Vec<PatchOp>)>,
    failing: HashSet<String>,
    failing_patches: HashSet<String>,
    finds: usize,
}

/// Credential store, credential API and vault in one, sharing a single document set.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: Mutex<StoreState>,
    page_size: Option<usize>,
}

fn not_found(operation: &str, id: &str) -> RepairError {
    RepairError::Api {
        operation: operation.to_string(),
        status: 404,
        body: format!("{{\"error\":\"not_found\",\"id\":\"{id}\"}}"),
    }
}

fn injected(operation: &str, id: &str) -> RepairError {
    RepairError::Api {
        operation: operation.to_string(),
        status: 500,
        body: format!("injected failure for {id}"),
    }
}

fn next_rev(rev: Option<&str>) -> String {
    let generation = rev
        .and_then(|r| r.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-mem", generation + 1)
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed documents in store order. Records without a revision get one.
    pub fn with_records(records: impl IntoIterator<Item = CredentialRecord>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for mut record in records {
                if record.rev.is_none() {
                    record.rev = Some(next_rev(None));
                }
                state.docs.push(record);
            }
        }
        store
    }

    /// Serve `find` in pages of at most `size` documents.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    pub fn with_secret(self, urn: impl Into<String>, generic: Map<String, Value>) -> Self {
        self.lock().secrets.insert(urn.into(), generic);
        self
    }

    /// Make every write that targets `id` fail with a server error.
    pub fn fail_writes_for(&self, id: impl Into<String>) {
        self.lock().failing.insert(id.into());
    }

    /// Make only patches of `id` fail; other writes to it still succeed.
    pub fn fail_patches_for(&self, id: impl Into<String>) {
        self.lock().failing_patches.insert(id.into());
    }

    pub fn records(&self) -> Vec<CredentialRecord> {
        self.lock().docs.clone()
    }

    pub fn record(&self, id: &str) -> Option<CredentialRecord> {
        self.lock().docs.iter().find(|d| d.id == id).cloned()
    }

    pub fn secrets(&self) -> IndexMap<String, Map<String, Value>> {
        self.lock().secrets.clone()
    }

    pub fn patches(&self) -> Vec<(String, Vec<PatchOp>)> {
        self.lock().patches.clone()
    }

    /// Number of `find` calls served so far.
    pub fn find_calls(&self) -> usize {
        self.lock().finds
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn find(
        &self,
        selector: &CredentialSelector,
        limit: usize,
        bookmark: Option<&str>,
    ) -> Result<CredentialPage> {
        let mut state = self.lock();
        state.finds += 1;
        let offset = match bookmark {
            Some(b) => b.parse::<usize>().map_err(|_| RepairError::Api {
                operation: "find credentials".to_string(),
                status: 400,
                body: format!("bad bookmark {b}"),
            })?,
            None => 0,
        };
        let matching: Vec<&CredentialRecord> =
            state.docs.iter().filter(|d| selector.matches(d)).collect();
        let size = self.page_size.map_or(limit, |p| p.min(limit));
        let end = (offset + size).min(matching.len());
        let docs: Vec<CredentialRecord> = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|d| (*d).clone())
            .collect();
        let bookmark = (end < matching.len()).then(|| end.to_string());
        Ok(CredentialPage { docs, bookmark })
    }

    fn get(&self, id: &str) -> Result<Option<CredentialRecord>> {
        Ok(self.record(id))
    }

    fn insert(&self, doc: &NewCredentialDocument) -> Result<String> {
        let value = serde_json::to_value(doc).map_err(|e| RepairError::Internal {
            message: e.to_string(),
        })?;
        let mut record: CredentialRecord =
            serde_json::from_value(value).map_err(|e| RepairError::Internal {
                message: e.to_string(),
            })?;
        let mut state = self.lock();
        state.next_id += 1;
        record.id = format!("mem-{:04}", state.next_id);
        record.rev = Some(next_rev(None));
        let id = record.id.clone();
        state.docs.push(record);
        Ok(id)
    }

    fn put(&self, record: &CredentialRecord) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(&record.id) {
            return Err(injected("put credential", &record.id));
        }
        let Some(current) = state.docs.iter_mut().find(|d| d.id == record.id) else {
            return Err(not_found("put credential", &record.id));
        };
        if current.rev != record.rev {
            return Err(RepairError::Api {
                operation: "put credential".to_string(),
                status: 409,
                body: "{\"error\":\"conflict\",\"reason\":\"Document update conflict.\"}"
                    .to_string(),
            });
        }
        let mut updated = record.clone();
        updated.rev = Some(next_rev(record.rev.as_deref()));
        *current = updated;
        Ok(())
    }

    fn delete(&self, record: &CredentialRecord) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(&record.id) {
            return Err(injected("delete credential", &record.id));
        }
        let before = state.docs.len();
        state.docs.retain(|d| d.id != record.id);
        if state.docs.len() == before {
            return Err(not_found("delete credential", &record.id));
        }
        Ok(())
    }
}

impl CredentialApi for MemoryCredentialStore {
    fn patch(&self, id: &str, ops: &[PatchOp]) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(id) || state.failing_patches.contains(id) {
            return Err(injected("patch credential", id));
        }
        if !state.docs.iter().any(|d| d.id == id) {
            return Err(not_found("patch credential", id));
        }
        state.patches.push((id.to_string(), ops.to_vec()));
        Ok(())
    }
}

impl SecretVault for MemoryCredentialStore {
    fn create_secret(&self, name: &str, generic: &Map<String, Value>) -> Result<String> {
        let urn = format!("{MEMORY_SECRET_OWNER}:{name}");
        self.lock().secrets.insert(urn.clone(), generic.clone());
        Ok(urn)
    }

    fn read_record_secret(&self, record: &CredentialRecord) -> Result<Option<Map<String, Value>>> {
        Ok(self.lock().secrets.get(&record.secret_id).cloned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedVersion {
    pub project_id: String,
    pub pipeline_id: String,
    pub name: String,
    pub flow: Value,
}

#[derive(Debug, Clone)]
struct StoredPipeline {
    summary: PipelineSummary,
    flow: Option<Value>,
}

/// Projects and their pipeline flows.
#[derive(Debug, Default)]
pub struct MemoryPlatform {
    projects: Vec<Project>,
    pipelines: IndexMap<String, Vec<StoredPipeline>>,
    page_size: Option<usize>,
    uploads: Mutex<Vec<UploadedVersion>>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, id: &str, name: &str, storage_type: &str) -> Self {
        self.projects.push(Project {
            id: id.to_string(),
            name: name.to_string(),
            storage_type: storage_type.to_string(),
        });
        self
    }

    pub fn with_flow(mut self, project_id: &str, pipeline_id: &str, name: &str, flow: Value) -> Self {
        self.pipelines
            .entry(project_id.to_string())
            .or_default()
            .push(StoredPipeline {
                summary: PipelineSummary {
                    id: pipeline_id.to_string(),
                    name: name.to_string(),
                },
                flow: Some(flow),
            });
        self
    }

    /// A pipeline that is listed but whose flow cannot be fetched.
    pub fn with_unreadable_pipeline(mut self, project_id: &str, pipeline_id: &str, name: &str) -> Self {
        self.pipelines
            .entry(project_id.to_string())
            .or_default()
            .push(StoredPipeline {
                summary: PipelineSummary {
                    id: pipeline_id.to_string(),
                    name: name.to_string(),
                },
                flow: None,
            });
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    pub fn uploads(&self) -> Vec<UploadedVersion> {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn page<T: Clone>(&self, items: &[T], cursor: Option<&str>) -> Result<Page<T>> {
        let offset = match cursor {
            Some(c) => c.parse::<usize>().map_err(|_| RepairError::Api {
                operation: "list".to_string(),
                status: 400,
                body: format!("bad cursor {c}"),
            })?,
            None => 0,
        };
        let size = self.page_size.unwrap_or(items.len().max(1));
        let end = (offset + size).min(items.len());
        Ok(Page {
            items: items.get(offset..end).unwrap_or_default().to_vec(),
            next: (end < items.len()).then(|| end.to_string()),
        })
    }

    fn stored(&self, project_id: &str, pipeline_id: &str) -> Option<&StoredPipeline> {
        self.pipelines
            .get(project_id)?
            .iter()
            .find(|p| p.summary.id == pipeline_id)
    }
}

impl PlatformApi for MemoryPlatform {
    fn list_projects(&self, cursor: Option<&str>) -> Result<Page<Project>> {
        self.page(&self.projects, cursor)
    }

    fn get_project(&self, project_id: &str) -> Result<Project> {
        self.projects
            .iter()
            .find(|p| p.id == project_id)
            .cloned()
            .ok_or_else(|| not_found("get project", project_id))
    }

    fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.projects.iter().find(|p| p.name == name).cloned())
    }

    fn list_pipelines(
        &self,
        project_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<PipelineSummary>> {
        let summaries: Vec<PipelineSummary> = self
            .pipelines
            .get(project_id)
            .map(|pipelines| pipelines.iter().map(|p| p.summary.clone()).collect())
            .unwrap_or_default();
        self.page(&summaries, cursor)
    }

    fn fetch_flow(&self, project_id: &str, pipeline_id: &str) -> Result<Value> {
        self.stored(project_id, pipeline_id)
            .and_then(|p| p.flow.clone())
            .ok_or_else(|| not_found("get pipeline flow", pipeline_id))
    }

    fn upload_pipeline_version(
        &self,
        project_id: &str,
        pipeline_id: &str,
        name: &str,
        flow: &Value,
    ) -> Result<()> {
        if self.stored(project_id, pipeline_id).is_none() {
            return Err(not_found("upload pipeline version", pipeline_id));
        }
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(UploadedVersion {
                project_id: project_id.to_string(),
                pipeline_id: pipeline_id.to_string(),
                name: name.to_string(),
                flow: flow.clone(),
            });
        Ok(())
    }
}
