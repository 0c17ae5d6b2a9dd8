//! Offline edits pushed to the in-memory server once connectivity returns.

use std::sync::Arc;

use fieldsync_common::EntityKind;
use fieldsync_remote::MemoryRemote;
use fieldsync_storage::model::{
    EquipmentBody, LocationBody, MoistureLogBody, NoteBody, ProjectBody, RoomBody,
};
use fieldsync_storage::{EntityBody, LocalStore, MemoryCheckpointStore, MemoryStore, Record};
use fieldsync_sync::{SharedNetworkFlag, SyncConfig, SyncContext, SyncEngine};

const LOCAL_ROOM_ID: i64 = -1_700_000_000_000;
const SERVER_ROOM_ID: i64 = 9321;
const PROJECT_ID: i64 = 500;

struct World {
    store: Arc<MemoryStore>,
    remote: Arc<MemoryRemote>,
    network: Arc<SharedNetworkFlag>,
    engine: SyncEngine,
}

fn world(config: SyncConfig) -> World {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MemoryRemote::new());
    let network = Arc::new(SharedNetworkFlag::new(true));
    let ctx = SyncContext::new(
        store.clone(),
        remote.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        network.clone(),
    );
    let engine = SyncEngine::new(ctx, config).unwrap();
    World {
        store,
        remote,
        network,
        engine,
    }
}

/// Backoff delays of zero so every skipped operation is due on the next cycle.
fn eager_config() -> SyncConfig {
    SyncConfig {
        retry_base_secs: 0,
        skip_base_secs: 0,
        company_id: Some(7),
        ..SyncConfig::default()
    }
}

async fn drain(w: &World) {
    for _ in 0..5 {
        let report = w.engine.sync_cycle().await.unwrap();
        assert!(!report.offline);
        if w.store.operations().await.unwrap().is_empty() {
            return;
        }
    }
    panic!("queue not drained: {:?}", w.store.operations().await.unwrap());
}

#[tokio::test]
async fn room_server_id_reaches_queued_children() {
    let w = world(eager_config());
    w.network.set_available(false);

    let room = Record::new_local(
        LOCAL_ROOM_ID,
        EntityBody::Room(RoomBody {
            project_id: PROJECT_ID,
            location_id: None,
            level_id: None,
            title: "Master bath".to_string(),
            room_type: Some("bathroom".to_string()),
        }),
    );
    w.store.save(room.clone()).await.unwrap();
    w.engine.processor().enqueue_room_create(&room).await.unwrap();

    let note = w
        .engine
        .notes()
        .create_note(NoteBody {
            project_id: PROJECT_ID,
            room_id: Some(LOCAL_ROOM_ID),
            content: "Standing water behind vanity".to_string(),
            category_id: None,
        })
        .await
        .unwrap();
    let equipment = w
        .engine
        .equipment()
        .upsert_equipment(
            None,
            EquipmentBody {
                project_id: PROJECT_ID,
                room_id: Some(LOCAL_ROOM_ID),
                equipment_type: "dehumidifier".to_string(),
                quantity: 2,
                status: "placed".to_string(),
            },
        )
        .await
        .unwrap();
    let log = w
        .engine
        .moisture()
        .upsert_moisture_log(
            None,
            MoistureLogBody {
                project_id: PROJECT_ID,
                room_id: Some(LOCAL_ROOM_ID),
                material: "drywall".to_string(),
                reading: 38.5,
            },
        )
        .await
        .unwrap();

    assert!(w.engine.sync_cycle().await.unwrap().offline);
    assert_eq!(w.store.operations().await.unwrap().len(), 4);

    w.remote.set_next_id(SERVER_ROOM_ID);
    w.network.set_available(true);
    drain(&w).await;

    let room = w.store.resolve(EntityKind::Room, SERVER_ROOM_ID).await.unwrap().unwrap();
    assert_eq!(room.server_id, Some(SERVER_ROOM_ID));
    assert!(!room.is_dirty);

    for (kind, id) in [
        (EntityKind::Note, note.id),
        (EntityKind::Equipment, equipment.id),
        (EntityKind::MoistureLog, log.id),
    ] {
        let local = w.store.resolve(kind, id).await.unwrap().unwrap();
        assert_eq!(local.body.reference(EntityKind::Room), Some(SERVER_ROOM_ID), "{kind}");
        let server_id = local.server_id.unwrap();
        let remote = w.remote.record(kind, server_id).unwrap();
        assert_eq!(remote.body.reference(EntityKind::Room), Some(SERVER_ROOM_ID), "{kind}");
    }
}

#[tokio::test]
async fn offline_project_tree_syncs_in_dependency_order() {
    let w = world(eager_config());
    w.network.set_available(false);

    let project = w
        .engine
        .projects()
        .create_project(ProjectBody {
            company_id: Some(7),
            title: "Hail damage".to_string(),
            status: "active".to_string(),
            property_id: None,
            assigned_user_ids: vec![],
        })
        .await
        .unwrap();
    let location = w
        .engine
        .locations()
        .create_location(LocationBody {
            project_id: project.id,
            property_id: None,
            title: "Upstairs".to_string(),
            location_type: "floor".to_string(),
            parent_location_id: None,
        })
        .await
        .unwrap();
    let room = w
        .engine
        .locations()
        .create_room(RoomBody {
            project_id: project.id,
            location_id: Some(location.id),
            level_id: None,
            title: "Bedroom 2".to_string(),
            room_type: None,
        })
        .await
        .unwrap();
    w.engine
        .notes()
        .create_note(NoteBody {
            project_id: project.id,
            room_id: Some(room.id),
            content: "Ceiling stain".to_string(),
            category_id: None,
        })
        .await
        .unwrap();

    w.network.set_available(true);
    drain(&w).await;

    let project = w.store.resolve(EntityKind::Project, project.id).await.unwrap().unwrap();
    let project_server_id = project.server_id.unwrap();
    let location = w.store.resolve(EntityKind::Location, location.id).await.unwrap().unwrap();
    let location_server_id = location.server_id.unwrap();

    let remote_rooms = w.remote.records(EntityKind::Room);
    assert_eq!(remote_rooms.len(), 1);
    assert_eq!(remote_rooms[0].body.project_id(), Some(project_server_id));
    assert_eq!(
        remote_rooms[0].body.reference(EntityKind::Location),
        Some(location_server_id)
    );
    let remote_notes = w.remote.records(EntityKind::Note);
    assert_eq!(remote_notes.len(), 1);
    assert_eq!(
        remote_notes[0].body.reference(EntityKind::Room),
        Some(remote_rooms[0].id)
    );
    assert_eq!(w.remote.create_calls(), 4);

    // A later deletion on the server cascades through the local tree.
    w.remote.remove(EntityKind::Project, project_server_id);
    let report = w.engine.sync_cycle().await.unwrap();
    assert!(report.deleted.unwrap().total() >= 4);
    let note = &w.store.list(EntityKind::Note).await.unwrap()[0];
    assert!(note.is_deleted);
}
