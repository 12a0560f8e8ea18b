//! Credential documents read and written directly in the document store.

use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::{
    config::StoreConfig,
    error::{RepairError, Result},
    http::client::HttpClient,
    inventory::CredentialSelector,
    model::{CredentialRecord, NewCredentialDocument},
    store::{CredentialPage, CredentialStore},
};

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    docs: Vec<CredentialRecord>,
    #[serde(default)]
    bookmark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    id: String,
}

pub struct CouchStore {
    client: HttpClient,
    database: Url,
    username: String,
    password: String,
}

impl CouchStore {
    /// The store is only reached through the loopback tunnel, whose certificate is
    /// issued for the in-cluster service name and never matches `127.0.0.1`.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let database = Url::parse(&config.database_url())
            .map_err(|e| RepairError::config(format!("invalid document store url: {e}")))?;
        let client = HttpClient::new(true, std::time::Duration::from_secs(120), config.retry)?;
        Ok(CouchStore {
            client,
            database,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn doc_url(&self, segment: &str) -> Result<Url> {
        let mut url = self.database.clone();
        url.path_segments_mut()
            .map_err(|_| RepairError::Internal {
                message: format!("document store url {} cannot take a path", self.database),
            })?
            .push(segment);
        Ok(url)
    }
}

impl CredentialStore for CouchStore {
    fn find(
        &self,
        selector: &CredentialSelector,
        limit: usize,
        bookmark: Option<&str>,
    ) -> Result<CredentialPage> {
        let url = self.doc_url("_find")?;
        let mut query = json!({ "selector": selector.to_mango(), "limit": limit });
        if let Some(bookmark) = bookmark {
            query["bookmark"] = Value::String(bookmark.to_string());
        }
        let found: FindResponse = self.client.send_json("find credentials", |c| {
            c.post(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .json(&query)
        })?;
        Ok(CredentialPage {
            docs: found.docs,
            bookmark: found.bookmark.filter(|b| !b.is_empty() && b != "nil"),
        })
    }

    fn get(&self, id: &str) -> Result<Option<CredentialRecord>> {
        let url = self.doc_url(id)?;
        match self.client.send_json("get credential", |c| {
            c.get(url.clone())
                .basic_auth(&self.username, Some(&self.password))
        }) {
            Ok(record) => Ok(Some(record)),
            Err(RepairError::Api { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn insert(&self, doc: &NewCredentialDocument) -> Result<String> {
        let url = self.database.clone();
        let written: WriteResponse = self.client.send_once_json("insert credential", |c| {
            c.post(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .json(doc)
        })?;
        Ok(written.id)
    }

    fn put(&self, record: &CredentialRecord) -> Result<()> {
        let url = self.doc_url(&record.id)?;
        self.client.send("put credential", |c| {
            c.put(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .json(record)
        })?;
        Ok(())
    }

    fn delete(&self, record: &CredentialRecord) -> Result<()> {
        let rev = record.rev.as_deref().ok_or_else(|| RepairError::Internal {
            message: format!("record {} has no revision to delete", record.id),
        })?;
        let url = self.doc_url(&record.id)?;
        self.client.send("delete credential", |c| {
            c.delete(url.clone())
                .basic_auth(&self.username, Some(&self.password))
                .query(&[("rev", rev)])
        })?;
        Ok(())
    }
}
