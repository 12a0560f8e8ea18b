//! Platform REST endpoints: projects, orchestration flow assets, pipeline templates,
//! credential patches and vault secrets.

use reqwest::blocking::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    bootstrap::mint_user_token,
    config::PlatformConfig,
    error::{RepairError, Result},
    http::client::HttpClient,
    model::{CredentialRecord, Page, PatchOp, PipelineSummary, Project},
    store::{CredentialApi, PlatformApi, SecretVault},
};

const PROJECT_PAGE_SIZE: &str = "100";
const VAULT_URN: &str = "0000000000:internal";

#[derive(Debug, Deserialize)]
struct ProjectList {
    #[serde(default)]
    resources: Vec<ProjectResource>,
    #[serde(default)]
    bookmark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectResource {
    metadata: ProjectMetadata,
    #[serde(default)]
    entity: ProjectEntity,
}

#[derive(Debug, Deserialize)]
struct ProjectMetadata {
    guid: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectEntity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    storage: Option<ProjectStorage>,
}

#[derive(Debug, Deserialize)]
struct ProjectStorage {
    #[serde(rename = "type", default)]
    kind: String,
}

impl From<ProjectResource> for Project {
    fn from(resource: ProjectResource) -> Self {
        Project {
            id: resource.metadata.guid,
            name: resource.entity.name,
            storage_type: resource
                .entity
                .storage
                .map(|storage| storage.kind)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssetSearch {
    #[serde(default)]
    results: Vec<AssetResult>,
    #[serde(default)]
    next: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AssetResult {
    metadata: AssetMetadata,
}

#[derive(Debug, Deserialize)]
struct AssetMetadata {
    asset_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct FlowTemplate {
    flow: String,
}

#[derive(Debug, Deserialize)]
struct CreatedSecret {
    secret_urn: String,
}

pub struct HttpPlatform {
    client: HttpClient,
    host: String,
    token: String,
    service_broker_token: Option<String>,
}

impl HttpPlatform {
    /// `token` is the bearer token used for every call made on the operator's behalf.
    pub fn new(config: &PlatformConfig, token: impl Into<String>) -> Result<Self> {
        let client = HttpClient::new(
            config.accept_invalid_certs,
            config.request_timeout,
            config.retry,
        )?;
        Ok(HttpPlatform {
            client,
            host: config.host.clone(),
            token: token.into(),
            service_broker_token: None,
        })
    }

    /// Enables reading secrets on behalf of their owners.
    pub fn with_service_broker_token(mut self, token: Option<String>) -> Self {
        self.service_broker_token = token;
        self
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    fn projects_page(&self, query: &[(&str, &str)]) -> Result<ProjectList> {
        let url = self.url("/v2/projects");
        self.client.send_json("list projects", |c| {
            c.get(&url).bearer_auth(&self.token).query(query)
        })
    }
}

impl PlatformApi for HttpPlatform {
    fn list_projects(&self, cursor: Option<&str>) -> Result<Page<Project>> {
        let mut query = vec![("limit", PROJECT_PAGE_SIZE)];
        if let Some(bookmark) = cursor {
            query.push(("bookmark", bookmark));
        }
        let list = self.projects_page(&query)?;
        let next = list
            .bookmark
            .filter(|b| !b.is_empty() && !list.resources.is_empty());
        Ok(Page {
            items: list.resources.into_iter().map(Project::from).collect(),
            next,
        })
    }

    fn get_project(&self, project_id: &str) -> Result<Project> {
        let url = self.url(&format!("/v2/projects/{project_id}"));
        let resource: ProjectResource = self
            .client
            .send_json("get project", |c| c.get(&url).bearer_auth(&self.token))?;
        Ok(resource.into())
    }

    fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let list = self.projects_page(&[("limit", PROJECT_PAGE_SIZE), ("name", name)])?;
        Ok(list
            .resources
            .into_iter()
            .map(Project::from)
            .find(|project| project.name == name))
    }

    fn list_pipelines(
        &self,
        project_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<PipelineSummary>> {
        let query = match cursor {
            Some(next) => serde_json::from_str(next).map_err(|e| RepairError::Internal {
                message: format!("bad pipeline search cursor: {e}"),
            })?,
            None => json!({ "query": "*:*" }),
        };
        let url = self.url("/v2/asset_types/orchestration_flow/search");
        let search: AssetSearch = self.client.send_json("search pipelines", |c| {
            c.post(&url)
                .bearer_auth(&self.token)
                .query(&[("project_id", project_id)])
                .json(&query)
        })?;
        let next = match search.next {
            Some(Value::Null) | None => None,
            Some(next) if search.results.is_empty() => {
                debug!(project_id, cursor = %next, "empty search page carries a cursor");
                None
            }
            Some(next) => Some(next.to_string()),
        };
        Ok(Page {
            items: search
                .results
                .into_iter()
                .map(|r| PipelineSummary {
                    id: r.metadata.asset_id,
                    name: r.metadata.name,
                })
                .collect(),
            next,
        })
    }

    fn fetch_flow(&self, project_id: &str, pipeline_id: &str) -> Result<Value> {
        let url = self.url(&format!("/apis/v1/pipelines/{pipeline_id}/templates"));
        let template: FlowTemplate = self.client.send_json("get pipeline flow", |c| {
            c.get(&url)
                .bearer_auth(&self.token)
                .header("Project-ID", project_id)
                .query(&[("format", "flow"), ("version", "any")])
        })?;
        serde_json::from_str(&template.flow).map_err(|e| RepairError::Decode {
            operation: "get pipeline flow".to_string(),
            message: format!("embedded flow is not JSON: {e}"),
        })
    }

    fn upload_pipeline_version(
        &self,
        project_id: &str,
        pipeline_id: &str,
        name: &str,
        flow: &Value,
    ) -> Result<()> {
        let body = serde_json::to_vec_pretty(flow).map_err(|e| RepairError::Internal {
            message: format!("cannot serialize flow: {e}"),
        })?;
        let url = self.url("/apis/v1/pipelines/upload_version");
        self.client.send_once("upload pipeline version", |c| {
            let form = Form::new().part(
                "uploadfile",
                Part::bytes(body.clone()).file_name(format!("{pipeline_id}.json")),
            );
            c.post(&url)
                .bearer_auth(&self.token)
                .header("Project-ID", project_id)
                .query(&[("name", name), ("pipelineid", pipeline_id), ("volatile", "true")])
                .multipart(form)
        })?;
        Ok(())
    }
}

impl CredentialApi for HttpPlatform {
    fn patch(&self, id: &str, ops: &[PatchOp]) -> Result<()> {
        let url = self.url(&format!("/v1/task_credentials/{id}"));
        self.client.send("patch credential", |c| {
            c.patch(&url).bearer_auth(&self.token).json(ops)
        })?;
        Ok(())
    }
}

impl SecretVault for HttpPlatform {
    fn create_secret(&self, name: &str, generic: &Map<String, Value>) -> Result<String> {
        let url = self.url("/zen-data/v2/secrets");
        let body = json!({
            "secret_name": name,
            "type": "generic",
            "vault_urn": VAULT_URN,
            "secret": { "generic": generic },
        });
        let created: CreatedSecret = self.client.send_once_json("create secret", |c| {
            c.post(&url).bearer_auth(&self.token).json(&body)
        })?;
        Ok(created.secret_urn)
    }

    fn read_record_secret(&self, record: &CredentialRecord) -> Result<Option<Map<String, Value>>> {
        let Some(broker_token) = self.service_broker_token.as_deref() else {
            return Ok(None);
        };
        let Some(owner_id) = record.secret_owner_id() else {
            warn!(record_id = %record.id, "secret id carries no owner");
            return Ok(None);
        };
        let owner_token = mint_user_token(
            &self.client,
            &self.host,
            broker_token,
            owner_id,
            &record.owner.user_id,
        )?;
        let url = self.url(&format!("/zen-data/v2/secrets/{}", record.secret_id));
        let body: Value = match self
            .client
            .send_json("read secret", |c| c.get(&url).bearer_auth(&owner_token))
        {
            Ok(body) => body,
            Err(RepairError::Api { status, body, .. }) => {
                warn!(record_id = %record.id, status, "could not read secret: {body}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        match body.pointer("/data/secret/generic").and_then(Value::as_object) {
            Some(generic) => Ok(Some(generic.clone())),
            None => {
                warn!(record_id = %record.id, "secret has no generic payload");
                Ok(None)
            }
        }
    }
}
