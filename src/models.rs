//! Application collections and the migrations that shape their data.

use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::error::Result;
use crate::migration::{Migration, Migrations};
use crate::model::{Actor, DocumentId, Patch, Query};
use crate::provision::drive::DocumentType;
use crate::schema::{Field, FieldType, Schema};
use crate::soft_delete::SoftDeleteCollection;
use crate::store::SharedStore;

pub const DOCUMENTS: &str = "documents";
pub const HUNT_FOLDERS: &str = "hunt_folders";
pub const FOLDER_PERMISSIONS: &str = "folder_permissions";

/// Puzzle documents: one per puzzle, tagged by provider.
pub fn documents_schema() -> Result<Schema> {
    Schema::builder()
        .required("hunt", FieldType::Id)
        .required("puzzle", FieldType::Id)
        .discriminator("provider")
        .variant(
            "google",
            vec![Field::required(
                "value",
                FieldType::object(vec![
                    Field::required("type", FieldType::enumeration(&["spreadsheet", "document"])),
                    Field::required("id", FieldType::NonEmptyString),
                    Field::optional("folder", FieldType::NonEmptyString),
                ]),
            )],
        )
        .soft_delete()
        .build()
}

/// One folder per hunt, keyed by the hunt's id.
pub fn hunt_folders_schema() -> Result<Schema> {
    Schema::builder()
        .required("folder", FieldType::NonEmptyString)
        .build()
}

/// Folder shares already granted, one per (folder, user, googleAccount).
pub fn folder_permissions_schema() -> Result<Schema> {
    Schema::builder()
        .required("folder", FieldType::NonEmptyString)
        .required("user", FieldType::NonEmptyString)
        .required("googleAccount", FieldType::NonEmptyString)
        .build()
}

/// Record id enforcing uniqueness of a folder share.
pub fn folder_permission_id(folder: &str, user: &str, google_account: &str) -> DocumentId {
    DocumentId(format!("{folder}:{user}:{google_account}"))
}

pub fn documents(store: SharedStore) -> Result<SoftDeleteCollection> {
    SoftDeleteCollection::new(Collection::new(store, DOCUMENTS, documents_schema()?))
}

pub fn hunt_folders(store: SharedStore) -> Result<Collection> {
    Ok(Collection::new(store, HUNT_FOLDERS, hunt_folders_schema()?))
}

pub fn folder_permissions(store: SharedStore) -> Result<Collection> {
    Ok(Collection::new(store, FOLDER_PERMISSIONS, folder_permissions_schema()?))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogleDocument {
    #[serde(rename = "type")]
    pub document_type: DocumentType,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub hunt: String,
    pub puzzle: String,
    pub provider: String,
    pub value: GoogleDocument,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HuntFolderRecord {
    pub folder: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderPermissionRecord {
    pub folder: String,
    pub user: String,
    pub google_account: String,
}

/// Migrations shipped with the library, in version order.
pub fn builtin_migrations() -> Result<Migrations> {
    Migrations::new(vec![Migration::new(
        1,
        "backfill document folders",
        |store: SharedStore| async move { backfill_document_folders(store).await },
    )])
}

/// Documents created before folders were tracked get their hunt's folder.
/// Documents whose hunt has no folder record are left alone.
async fn backfill_document_folders(store: SharedStore) -> Result<()> {
    let documents = documents(store.clone())?;
    let folders = hunt_folders(store)?;

    for doc in documents.find_allowing_deleted(Query::all()).fetch().await? {
        if doc.get("value.folder").is_some() {
            continue;
        }
        let Some(hunt) = doc.get_str("hunt") else {
            continue;
        };
        let Some(folder) = folders.find_one(Query::by_id(hunt)).await? else {
            continue;
        };
        if let Some(folder) = folder.get_str("folder") {
            documents
                .inner()
                .update(&doc.id, &Patch::new().set("value.folder", folder), &Actor::system())
                .await?;
        }
    }
    Ok(())
}
