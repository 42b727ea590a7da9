//! Tauri plugin exposing the engine's commands and events
//!
//! Commands are invoked as `plugin:bucket-relay|<name>`; every engine event
//! is re-emitted to the webview under its topic name.

use log::{error, info, warn};
use std::sync::Arc;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Emitter, Manager, Runtime, State};

use crate::commands::Engine;
use crate::events::EngineEvent;
use crate::model::{
    CloneJob, CloneJobItem, CloneRequest, ConflictPolicy, EnqueueRequest, TransferQueueItem,
};

type EngineState<'a> = State<'a, Arc<Engine>>;

fn emit_event<R: Runtime>(app: &AppHandle<R>, event: &EngineEvent) {
    let topic = event.topic();
    let emitted = match event {
        EngineEvent::CloneProgress(payload) => app.emit(topic, payload),
        EngineEvent::CloneStatusChanged(payload) => app.emit(topic, payload),
        EngineEvent::CloneJobDeleted(payload) => app.emit(topic, payload),
        EngineEvent::TransferProgress(payload) => app.emit(topic, payload),
        EngineEvent::TransferStatusChanged(payload) => app.emit(topic, payload),
        EngineEvent::TransferRemoved(payload) => app.emit(topic, payload),
    };
    if let Err(e) = emitted {
        warn!("event_emit_failed: {} topic={} error={}", event.subject_id(), topic, e);
    }
}

/// Register the engine with the app, forward its events, and run recovery.
pub fn init<R: Runtime>(engine: Arc<Engine>) -> TauriPlugin<R> {
    Builder::new("bucket-relay")
        .invoke_handler(tauri::generate_handler![
            transfer_queue_list,
            transfer_queue_upsert,
            transfer_queue_delete,
            transfer_queue_clear_terminal,
            transfer_queue_enqueue,
            transfer_queue_cancel,
            transfer_queue_retry,
            clone_start,
            clone_job_list,
            clone_job_get,
            clone_job_items,
            clone_pause,
            clone_resume,
            clone_cancel,
            clone_job_delete,
            clone_retry_failed,
            object_presign,
        ])
        .setup(move |app, _api| {
            app.manage(engine.clone());

            let handle = app.clone();
            let mut events = engine.subscribe();
            tauri::async_runtime::spawn(async move {
                while let Some(event) = events.recv().await {
                    emit_event(&handle, &event);
                }
                info!("event_forwarder_stop");
            });

            let engine = engine.clone();
            tauri::async_runtime::spawn(async move {
                if let Err(e) = engine.recover().await {
                    error!("engine_recover_failed: {}", e);
                }
            });
            Ok(())
        })
        .build()
}

#[tauri::command]
async fn transfer_queue_list(engine: EngineState<'_>) -> Result<Vec<TransferQueueItem>, String> {
    engine.transfer_queue_list().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn transfer_queue_upsert(
    engine: EngineState<'_>,
    item: TransferQueueItem,
) -> Result<TransferQueueItem, String> {
    engine
        .transfer_queue_upsert(item)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn transfer_queue_delete(engine: EngineState<'_>, id: String) -> Result<(), String> {
    engine
        .transfer_queue_delete(&id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn transfer_queue_clear_terminal(engine: EngineState<'_>) -> Result<u64, String> {
    engine
        .transfer_queue_clear_terminal()
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn transfer_queue_enqueue(
    engine: EngineState<'_>,
    request: EnqueueRequest,
) -> Result<TransferQueueItem, String> {
    engine
        .transfer_queue_enqueue(request)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn transfer_queue_cancel(
    engine: EngineState<'_>,
    id: String,
) -> Result<TransferQueueItem, String> {
    engine
        .transfer_queue_cancel(&id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn transfer_queue_retry(
    engine: EngineState<'_>,
    id: String,
) -> Result<TransferQueueItem, String> {
    engine
        .transfer_queue_retry(&id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
#[allow(clippy::too_many_arguments)]
async fn clone_start(
    engine: EngineState<'_>,
    source_target_id: String,
    source_bucket: String,
    source_prefix: Option<String>,
    dest_target_id: String,
    dest_bucket: String,
    dest_prefix: Option<String>,
    conflict_policy: ConflictPolicy,
) -> Result<CloneJob, String> {
    let request = CloneRequest {
        source_target_id,
        source_bucket,
        source_prefix: source_prefix.unwrap_or_default(),
        dest_target_id,
        dest_bucket,
        dest_prefix: dest_prefix.unwrap_or_default(),
        conflict_policy,
    };
    engine.clone_start(request).await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn clone_job_list(engine: EngineState<'_>) -> Result<Vec<CloneJob>, String> {
    engine.clone_job_list().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn clone_job_get(engine: EngineState<'_>, job_id: String) -> Result<CloneJob, String> {
    engine.clone_job_get(&job_id).await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn clone_job_items(
    engine: EngineState<'_>,
    job_id: String,
) -> Result<Vec<CloneJobItem>, String> {
    engine
        .clone_job_items(&job_id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn clone_pause(engine: EngineState<'_>, job_id: String) -> Result<CloneJob, String> {
    engine.clone_pause(&job_id).await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn clone_resume(engine: EngineState<'_>, job_id: String) -> Result<CloneJob, String> {
    engine.clone_resume(&job_id).await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn clone_cancel(engine: EngineState<'_>, job_id: String) -> Result<CloneJob, String> {
    engine.clone_cancel(&job_id).await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn clone_job_delete(engine: EngineState<'_>, job_id: String) -> Result<(), String> {
    engine
        .clone_job_delete(&job_id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn clone_retry_failed(engine: EngineState<'_>, job_id: String) -> Result<CloneJob, String> {
    engine
        .clone_retry_failed(&job_id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn object_presign(
    engine: EngineState<'_>,
    target_id: String,
    bucket: String,
    key: String,
    ttl_secs: u64,
) -> Result<String, String> {
    engine
        .object_presign(&target_id, &bucket, &key, ttl_secs)
        .await
        .map_err(|e| e.to_string())
}
