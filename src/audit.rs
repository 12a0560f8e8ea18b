//! Audit dumps written before anything is mutated: every fetched flow and every
//! candidate credential group, plus a manifest of their blake3 digests.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    error::{RepairError, Result},
    model::CredentialRecord,
    path_safety::join_under_root,
};

pub const PROJECTS_DIR: &str = "projects";
pub const PIPELINES_DIR: &str = "pipelines";
pub const CREDENTIALS_DIR: &str = "creds";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    algorithm: &'static str,
    files: &'a BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct AuditWriter {
    root: PathBuf,
    /// relative path -> blake3 hex digest
    digests: BTreeMap<String, String>,
}

impl AuditWriter {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| RepairError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(AuditWriter {
            root,
            digests: BTreeMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digests(&self) -> &BTreeMap<String, String> {
        &self.digests
    }

    /// `projects/<project>/pipelines/<pipeline>.json`
    pub fn write_flow(&mut self, project_id: &str, pipeline_id: &str, flow: &Value) -> Result<PathBuf> {
        let file = format!("{pipeline_id}.json");
        let path = join_under_root(&self.root, &[PROJECTS_DIR, project_id, PIPELINES_DIR, &file])?;
        self.write_json(path, flow)
    }

    /// `creds/<primary_pipeline_id>_secrets.json`
    pub fn write_credentials(
        &mut self,
        primary_pipeline_id: &str,
        records: &[CredentialRecord],
    ) -> Result<PathBuf> {
        let file = format!("{primary_pipeline_id}_secrets.json");
        let path = join_under_root(&self.root, &[CREDENTIALS_DIR, &file])?;
        self.write_json(path, records)
    }

    pub fn write_manifest(&self) -> Result<PathBuf> {
        let path = self.root.join(CREDENTIALS_DIR).join(MANIFEST_FILE);
        let manifest = Manifest {
            algorithm: "blake3",
            files: &self.digests,
        };
        let bytes = to_pretty_bytes(&manifest)?;
        write_file(&path, &bytes)?;
        Ok(path)
    }

    fn write_json<T: Serialize + ?Sized>(&mut self, path: PathBuf, value: &T) -> Result<PathBuf> {
        let bytes = to_pretty_bytes(value)?;
        write_file(&path, &bytes)?;
        let relative = path
            .strip_prefix(&self.root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let digest = blake3::hash(&bytes).to_hex().to_string();
        debug!(file = %relative, digest = %digest, "audit dump written");
        self.digests.insert(relative, digest);
        Ok(path)
    }
}

fn to_pretty_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| RepairError::Internal {
        message: format!("cannot serialize audit dump: {e}"),
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RepairError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| RepairError::Io {
        path: path.to_path_buf(),
        source,
    })
}
