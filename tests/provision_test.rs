use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use huntstore::Error;
use huntstore::config::{DocumentTemplates, DriveConfig};
use huntstore::lock::{LockConfig, LockManager};
use huntstore::model::{Actor, DocumentId, Patch};
use huntstore::models;
use huntstore::provision::drive::{
    Drive, DocumentType, Hunt, Puzzle, hunt_folder_name, puzzle_document_name,
};
use huntstore::provision::{CreateRequest, ExternalId, Grantee, ResourceProvider, ResourceType};
use huntstore::store::{MemoryStore, SharedStore};

/// Records every call; creation is slow enough for callers to overlap.
#[derive(Default)]
struct FakeDrive {
    created: Mutex<Vec<CreateRequest>>,
    moves: Mutex<Vec<(ExternalId, ExternalId)>>,
    renames: Mutex<Vec<(ExternalId, String)>>,
    grants: Mutex<Vec<(ExternalId, Grantee, String)>>,
    next_id: AtomicUsize,
    fail_creates: AtomicBool,
}

impl FakeDrive {
    fn creates_of(&self, resource_type: ResourceType) -> Vec<CreateRequest> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResourceProvider for FakeDrive {
    async fn create(&self, request: &CreateRequest) -> huntstore::Result<ExternalId> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::External {
                operation: "create",
                message: "quota exceeded".into(),
            });
        }
        self.created.lock().unwrap().push(request.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(ExternalId(format!("ext-{n}")))
    }

    async fn move_to(&self, id: &ExternalId, new_parent: &ExternalId) -> huntstore::Result<()> {
        self.moves
            .lock()
            .unwrap()
            .push((id.clone(), new_parent.clone()));
        Ok(())
    }

    async fn rename(&self, id: &ExternalId, name: &str) -> huntstore::Result<()> {
        self.renames
            .lock()
            .unwrap()
            .push((id.clone(), name.to_string()));
        Ok(())
    }

    async fn grant(&self, id: &ExternalId, grantee: &Grantee, role: &str) -> huntstore::Result<()> {
        self.grants
            .lock()
            .unwrap()
            .push((id.clone(), grantee.clone(), role.to_string()));
        Ok(())
    }
}

fn drive_config() -> DriveConfig {
    DriveConfig {
        team_name: "Rubber Ducks".to_string(),
        root_folder: Some("root".to_string()),
        templates: DocumentTemplates {
            spreadsheet: Some("sheet-template".to_string()),
            document: None,
        },
    }
}

fn drive(store: &SharedStore, fake: &Arc<FakeDrive>) -> Drive {
    let locks = LockManager::new(
        store.clone(),
        LockConfig {
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(10),
            ..LockConfig::default()
        },
    );
    Drive::new(
        store.clone(),
        locks,
        fake.clone(),
        &drive_config(),
        Duration::from_secs(30),
    )
    .unwrap()
}

fn hunt() -> Hunt {
    Hunt {
        id: DocumentId::new(),
        name: "Mystery Hunt 2024".to_string(),
    }
}

fn puzzle_in(hunt: &Hunt) -> Puzzle {
    Puzzle {
        id: DocumentId::new(),
        hunt: hunt.id.clone(),
        title: "Crossword".to_string(),
    }
}

#[test]
fn names_follow_team_conventions() {
    assert_eq!(hunt_folder_name("Ducks", "MH"), "Ducks MH");
    assert_eq!(puzzle_document_name("Maze", "Ducks"), "Maze: Ducks");
}

#[tokio::test]
async fn hunt_folder_is_created_once_under_root() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let hunt = hunt();

    let first = drive.ensure_hunt_folder(&hunt).await.unwrap();
    let second = drive.ensure_hunt_folder(&hunt).await.unwrap();
    assert_eq!(first, second);

    let creates = fake.creates_of(ResourceType::Folder);
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].name, "Rubber Ducks Mystery Hunt 2024");
    assert_eq!(creates[0].parent, Some(ExternalId::from("root")));

    let record = drive.hunt_folders().find_one(&hunt.id).await.unwrap().unwrap();
    assert_eq!(record.get_str("folder"), Some(first.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensures_create_one_document() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let hunt = hunt();
    let puzzle = puzzle_in(&hunt);

    let mut handles = Vec::new();
    for _ in 0..6 {
        // A separate facade and lock manager per task, like separate processes.
        let drive = drive(&store, &fake);
        let (hunt, puzzle) = (hunt.clone(), puzzle.clone());
        handles.push(tokio::spawn(async move {
            drive
                .ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet)
                .await
        }));
    }

    let mut resources = Vec::new();
    let mut created = 0;
    for handle in handles {
        let provisioned = handle.await.unwrap().unwrap();
        created += usize::from(provisioned.created);
        resources.push(provisioned.resource);
    }

    assert_eq!(created, 1);
    assert!(resources.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(fake.creates_of(ResourceType::Folder).len(), 1);
    let sheets = fake.creates_of(ResourceType::Spreadsheet);
    assert_eq!(sheets.len(), 1);
    assert_eq!(sheets[0].name, "Crossword: Rubber Ducks");
    assert!(fake.moves.lock().unwrap().is_empty());

    let documents = models::documents(store).unwrap();
    assert_eq!(documents.find(Default::default()).count().await.unwrap(), 1);
}

#[tokio::test]
async fn document_record_matches_schema_shape() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let hunt = hunt();
    let puzzle = puzzle_in(&hunt);

    let provisioned = drive
        .ensure_document(&hunt, &puzzle, DocumentType::Document)
        .await
        .unwrap();
    let record: models::DocumentRecord = provisioned.record.decode().unwrap();
    let folder = drive.ensure_hunt_folder(&hunt).await.unwrap();

    assert_eq!(record.hunt, hunt.id.as_str());
    assert_eq!(record.puzzle, puzzle.id.as_str());
    assert_eq!(record.provider, "google");
    assert_eq!(record.value.document_type, DocumentType::Document);
    assert_eq!(record.value.id, provisioned.resource.as_str());
    assert_eq!(record.value.folder.as_deref(), Some(folder.as_str()));
}

#[tokio::test]
async fn misplaced_document_is_moved_into_hunt_folder() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let hunt = hunt();
    let puzzle = puzzle_in(&hunt);

    let original = drive
        .ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet)
        .await
        .unwrap();
    drive
        .documents()
        .update(
            &original.record.id,
            &Patch::new().set("value.folder", "stale-folder"),
            &Actor::system(),
        )
        .await
        .unwrap();

    let again = drive
        .ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet)
        .await
        .unwrap();
    assert!(!again.created);
    assert!(again.reconciled);
    assert_eq!(again.resource, original.resource);

    let folder = drive.ensure_hunt_folder(&hunt).await.unwrap();
    assert_eq!(*fake.moves.lock().unwrap(), [(original.resource.clone(), folder.clone())]);
    assert_eq!(again.record.get_str("value.folder"), Some(folder.as_str()));

    // Reconciled state is stable.
    let third = drive
        .ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet)
        .await
        .unwrap();
    assert!(!third.reconciled);
    assert_eq!(fake.moves.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_creation_leaves_no_record_and_frees_the_lock() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let hunt = hunt();

    fake.fail_creates.store(true, Ordering::SeqCst);
    let err = drive.ensure_hunt_folder(&hunt).await.unwrap_err();
    assert!(matches!(err, Error::External { operation: "create", .. }));
    assert!(drive.hunt_folders().find_one(&hunt.id).await.unwrap().is_none());

    fake.fail_creates.store(false, Ordering::SeqCst);
    drive.ensure_hunt_folder(&hunt).await.unwrap();
    assert_eq!(fake.creates_of(ResourceType::Folder).len(), 1);
}

#[tokio::test]
async fn deleted_document_is_replaced() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let hunt = hunt();
    let puzzle = puzzle_in(&hunt);

    let first = drive
        .ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet)
        .await
        .unwrap();
    models::documents(store.clone())
        .unwrap()
        .destroy(&first.record.id, &Actor::new("alice"))
        .await
        .unwrap();

    let second = drive
        .ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet)
        .await
        .unwrap();
    assert!(second.created);
    assert_ne!(second.resource, first.resource);
}

#[tokio::test]
async fn puzzle_from_another_hunt_is_rejected() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let puzzle = puzzle_in(&hunt());

    let err = drive
        .ensure_document(&hunt(), &puzzle, DocumentType::Spreadsheet)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Other(_)));
    assert!(fake.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rename_passes_through() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let hunt = hunt();
    let mut puzzle = puzzle_in(&hunt);

    assert!(!drive.rename_document(&puzzle).await.unwrap());

    let provisioned = drive
        .ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet)
        .await
        .unwrap();
    puzzle.title = "Cryptic Crossword".to_string();
    assert!(drive.rename_document(&puzzle).await.unwrap());
    assert_eq!(
        *fake.renames.lock().unwrap(),
        [(provisioned.resource.clone(), "Cryptic Crossword: Rubber Ducks".to_string())]
    );
}

#[tokio::test]
async fn new_documents_copy_templates_and_are_link_editable() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let hunt = hunt();

    let sheet = drive
        .ensure_document(&hunt, &puzzle_in(&hunt), DocumentType::Spreadsheet)
        .await
        .unwrap();
    let doc = drive
        .ensure_document(&hunt, &puzzle_in(&hunt), DocumentType::Document)
        .await
        .unwrap();

    let sheets = fake.creates_of(ResourceType::Spreadsheet);
    assert_eq!(sheets[0].template, Some(ExternalId::from("sheet-template")));
    assert_eq!(fake.creates_of(ResourceType::Document)[0].template, None);
    assert_eq!(fake.creates_of(ResourceType::Folder)[0].template, None);

    assert_eq!(
        *fake.grants.lock().unwrap(),
        [
            (sheet.resource.clone(), Grantee::Anyone, "writer".to_string()),
            (doc.resource.clone(), Grantee::Anyone, "writer".to_string()),
        ]
    );

    // Cached documents are not granted again.
    let puzzle = puzzle_in(&hunt);
    drive.ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet).await.unwrap();
    let cached = drive
        .ensure_document(&hunt, &puzzle, DocumentType::Spreadsheet)
        .await
        .unwrap();
    assert!(!cached.created);
    assert_eq!(fake.grants.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn folder_access_is_granted_once_per_account() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDrive::default());
    let drive = drive(&store, &fake);
    let hunt = hunt();
    let solver = Actor::new("solver");

    assert!(
        drive
            .grant_folder_access(&hunt, &solver, "solver@example.com", "writer")
            .await
            .unwrap()
    );
    assert!(
        !drive
            .grant_folder_access(&hunt, &solver, "solver@example.com", "writer")
            .await
            .unwrap()
    );
    // A second account for the same user is its own share.
    assert!(
        drive
            .grant_folder_access(&hunt, &solver, "solver@work.example.com", "writer")
            .await
            .unwrap()
    );

    let folder = drive.ensure_hunt_folder(&hunt).await.unwrap();
    assert_eq!(
        *fake.grants.lock().unwrap(),
        [
            (
                folder.clone(),
                Grantee::User("solver@example.com".to_string()),
                "writer".to_string()
            ),
            (
                folder.clone(),
                Grantee::User("solver@work.example.com".to_string()),
                "writer".to_string()
            ),
        ]
    );

    let recorded: Vec<models::FolderPermissionRecord> = drive
        .folder_permissions()
        .find(Default::default())
        .fetch_as()
        .await
        .unwrap();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.iter().all(|r| r.folder == folder.as_str() && r.user == "solver"));
}
