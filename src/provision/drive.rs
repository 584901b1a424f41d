//! Hunt folders and puzzle documents on a drive-style provider.
//!
//! Each hunt gets one folder, recorded in `hunt_folders` under the hunt's
//! id. Each puzzle gets one document inside its hunt's folder, recorded in
//! `documents`. Both are created at most once across every process.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    CreateRequest, ExternalId, Grantee, ProvisionCache, Provisioned, ResourceKind,
    ResourceProvider, ResourceType,
};
use crate::collection::Collection;
use crate::config::{DocumentTemplates, DriveConfig};
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::model::{Actor, DeletionFilter, Document, DocumentId, Patch, Query};
use crate::models::{self, FolderPermissionRecord};
use crate::store::SharedStore;

pub fn hunt_folder_name(team_name: &str, hunt_name: &str) -> String {
    format!("{team_name} {hunt_name}")
}

pub fn puzzle_document_name(puzzle_title: &str, team_name: &str) -> String {
    format!("{puzzle_title}: {team_name}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunt {
    pub id: DocumentId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Puzzle {
    pub id: DocumentId,
    pub hunt: DocumentId,
    pub title: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    #[default]
    Spreadsheet,
    Document,
}

impl From<DocumentType> for ResourceType {
    fn from(t: DocumentType) -> Self {
        match t {
            DocumentType::Spreadsheet => ResourceType::Spreadsheet,
            DocumentType::Document => ResourceType::Document,
        }
    }
}

// ---------------------------------------------------------------------------
// Hunt folders
// ---------------------------------------------------------------------------

pub struct HuntFolderKind {
    team_name: String,
    root: Option<ExternalId>,
}

impl HuntFolderKind {
    pub fn new(team_name: impl Into<String>, root: Option<ExternalId>) -> Self {
        Self {
            team_name: team_name.into(),
            root,
        }
    }
}

impl ResourceKind for HuntFolderKind {
    type Request = Hunt;

    fn kind(&self) -> &'static str {
        "hunt_folder"
    }

    fn lock_name(&self, hunt: &Hunt) -> String {
        format!("hunt:{}:folder", hunt.id)
    }

    fn lookup(&self, hunt: &Hunt) -> Query {
        Query::by_id(hunt.id.clone())
    }

    fn create_request(&self, hunt: &Hunt) -> CreateRequest {
        CreateRequest {
            name: hunt_folder_name(&self.team_name, &hunt.name),
            resource_type: ResourceType::Folder,
            parent: self.root.clone(),
            template: None,
        }
    }

    fn record_id(&self, hunt: &Hunt) -> Option<DocumentId> {
        Some(hunt.id.clone())
    }

    fn record(&self, _hunt: &Hunt, created: &ExternalId) -> Value {
        json!({ "folder": created })
    }

    fn resource_id(&self, record: &Document) -> Result<ExternalId> {
        stored_id(record, "folder")
    }
}

// ---------------------------------------------------------------------------
// Puzzle documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DocumentRequest {
    pub puzzle: Puzzle,
    pub document_type: DocumentType,
    /// Folder the document should live in.
    pub folder: ExternalId,
}

pub struct PuzzleDocumentKind {
    team_name: String,
    templates: DocumentTemplates,
}

impl PuzzleDocumentKind {
    pub fn new(team_name: impl Into<String>, templates: DocumentTemplates) -> Self {
        Self {
            team_name: team_name.into(),
            templates,
        }
    }

    fn template(&self, document_type: DocumentType) -> Option<ExternalId> {
        let template = match document_type {
            DocumentType::Spreadsheet => &self.templates.spreadsheet,
            DocumentType::Document => &self.templates.document,
        };
        template.as_deref().map(ExternalId::from)
    }
}

impl ResourceKind for PuzzleDocumentKind {
    type Request = DocumentRequest;

    fn kind(&self) -> &'static str {
        "puzzle_document"
    }

    fn lock_name(&self, request: &DocumentRequest) -> String {
        format!("puzzle:{}:documents", request.puzzle.id)
    }

    fn lookup(&self, request: &DocumentRequest) -> Query {
        Query::all()
            .eq("puzzle", request.puzzle.id.as_str())
            .with_deletion(DeletionFilter::ActiveOnly)
    }

    fn create_request(&self, request: &DocumentRequest) -> CreateRequest {
        CreateRequest {
            name: puzzle_document_name(&request.puzzle.title, &self.team_name),
            resource_type: request.document_type.into(),
            parent: Some(request.folder.clone()),
            template: self.template(request.document_type),
        }
    }

    /// Puzzle documents are editable by anyone with the link.
    fn initial_grants(&self, _request: &DocumentRequest) -> Vec<(Grantee, &'static str)> {
        vec![(Grantee::Anyone, "writer")]
    }

    fn record(&self, request: &DocumentRequest, created: &ExternalId) -> Value {
        json!({
            "hunt": request.puzzle.hunt,
            "puzzle": request.puzzle.id,
            "provider": "google",
            "value": {
                "type": request.document_type,
                "id": created,
                "folder": request.folder,
            },
        })
    }

    fn resource_id(&self, record: &Document) -> Result<ExternalId> {
        stored_id(record, "value.id")
    }

    fn desired_placement(&self, request: &DocumentRequest) -> Option<ExternalId> {
        Some(request.folder.clone())
    }

    fn placement(&self, record: &Document) -> Option<ExternalId> {
        record.get_str("value.folder").map(ExternalId::from)
    }

    fn placement_patch(&self, folder: &ExternalId) -> Patch {
        Patch::new().set("value.folder", folder.as_str())
    }
}

fn stored_id(record: &Document, path: &str) -> Result<ExternalId> {
    record
        .get_str(path)
        .map(ExternalId::from)
        .ok_or_else(|| Error::Other(format!("record {} has no {path}", record.id)))
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Folder and document provisioning for one team.
pub struct Drive {
    team_name: String,
    provider: Arc<dyn ResourceProvider>,
    folders: ProvisionCache<HuntFolderKind>,
    documents: ProvisionCache<PuzzleDocumentKind>,
    permissions: Collection,
}

impl Drive {
    pub fn new(
        store: SharedStore,
        locks: LockManager,
        provider: Arc<dyn ResourceProvider>,
        config: &DriveConfig,
        lock_ttl: Duration,
    ) -> Result<Self> {
        let root = config.root_folder.as_deref().map(ExternalId::from);
        let folders = ProvisionCache::new(
            Collection::new(
                store.clone(),
                models::HUNT_FOLDERS,
                models::hunt_folders_schema()?,
            ),
            locks.clone(),
            Arc::clone(&provider),
            HuntFolderKind::new(&config.team_name, root),
            lock_ttl,
        );
        let documents = ProvisionCache::new(
            Collection::new(store.clone(), models::DOCUMENTS, models::documents_schema()?),
            locks,
            Arc::clone(&provider),
            PuzzleDocumentKind::new(&config.team_name, config.templates.clone()),
            lock_ttl,
        );
        Ok(Self {
            team_name: config.team_name.clone(),
            provider,
            folders,
            documents,
            permissions: models::folder_permissions(store)?,
        })
    }

    /// Folder for `hunt`, created on first use.
    pub async fn ensure_hunt_folder(&self, hunt: &Hunt) -> Result<ExternalId> {
        Ok(self.folders.ensure(hunt).await?.resource)
    }

    /// Document for `puzzle`, created on first use and moved into the
    /// hunt's folder if it lives elsewhere.
    pub async fn ensure_document(
        &self,
        hunt: &Hunt,
        puzzle: &Puzzle,
        document_type: DocumentType,
    ) -> Result<Provisioned> {
        if puzzle.hunt != hunt.id {
            return Err(Error::Other(format!(
                "puzzle {} belongs to hunt {}, not {}",
                puzzle.id, puzzle.hunt, hunt.id
            )));
        }
        let folder = self.ensure_hunt_folder(hunt).await?;
        self.documents
            .ensure(&DocumentRequest {
                puzzle: puzzle.clone(),
                document_type,
                folder,
            })
            .await
    }

    /// Rename the puzzle's document to match its current title. Returns
    /// `false` when the puzzle has no document yet.
    pub async fn rename_document(&self, puzzle: &Puzzle) -> Result<bool> {
        let lookup = Query::all()
            .eq("puzzle", puzzle.id.as_str())
            .with_deletion(DeletionFilter::ActiveOnly);
        let Some(record) = self.documents.records().find_one(lookup).await? else {
            return Ok(false);
        };
        let id = stored_id(&record, "value.id")?;
        let name = puzzle_document_name(&puzzle.title, &self.team_name);
        self.provider.rename(&id, &name).await?;
        info!(puzzle = %puzzle.id, document = %id, name, "document renamed");
        Ok(true)
    }

    /// Share the hunt's folder with `user`'s Google account, creating the
    /// folder if needed. Returns `false` when the share is already recorded.
    pub async fn grant_folder_access(
        &self,
        hunt: &Hunt,
        user: &Actor,
        google_account: &str,
        role: &str,
    ) -> Result<bool> {
        let folder = self.ensure_hunt_folder(hunt).await?;
        let id = models::folder_permission_id(folder.as_str(), user.as_str(), google_account);
        if self.permissions.find_one(&id).await?.is_some() {
            debug!(hunt = %hunt.id, %folder, %user, "folder access already granted");
            return Ok(false);
        }

        self.provider
            .grant(&folder, &Grantee::User(google_account.to_string()), role)
            .await?;
        let record = FolderPermissionRecord {
            folder: folder.to_string(),
            user: user.to_string(),
            google_account: google_account.to_string(),
        };
        match self.permissions.insert_with_id(id, &record, &Actor::system()).await {
            // A concurrent grant recorded the same share first.
            Ok(_) | Err(Error::DuplicateId(_)) => {}
            Err(e) => return Err(e),
        }
        info!(hunt = %hunt.id, %folder, %user, role, "folder access granted");
        Ok(true)
    }

    pub fn hunt_folders(&self) -> &Collection {
        self.folders.records()
    }

    pub fn documents(&self) -> &Collection {
        self.documents.records()
    }

    pub fn folder_permissions(&self) -> &Collection {
        &self.permissions
    }
}
