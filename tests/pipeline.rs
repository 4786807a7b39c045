//! Pipeline Integration Tests
//!
//! Drives the boundary service and the analysis worker against a real
//! on-disk state directory: upload, analysis, search and download.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use callflow::adapters::{LocalStorage, ObjectStorage, ObjectStorageConfig};
use callflow::config::Settings;
use callflow::core::{CallService, CallStore, ErrorKind, RequeueOutcome, ServiceError};
use callflow::domain::CallStatus;
use callflow::ingest::{
    build_analyzer, AnalysisWorker, JobOutcome, JsonlTaskQueue, TaskQueue, WorkerConfig,
};
use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

/// Write a mono 16-bit WAV holding `seconds` of a 440 Hz tone
fn wav_bytes(seconds: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let samples = (spec.sample_rate as f32 * seconds) as u32;
        for n in 0..samples {
            let t = n as f32 / spec.sample_rate as f32;
            let value = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0;
            writer.write_sample(value as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

async fn open_service(home: &Path) -> (CallService, Settings) {
    let settings = Settings::rooted_at(home);
    let service = CallService::from_settings(&settings).await.unwrap();
    (service, settings)
}

/// A worker with its own store connection, as a separate process would have
async fn worker_for(settings: &Settings) -> AnalysisWorker {
    let store = Arc::new(CallStore::open(&settings.database).unwrap());
    let queue: Arc<dyn TaskQueue> = Arc::new(
        JsonlTaskQueue::open(&settings.queue_path, settings.queue.clone())
            .await
            .unwrap(),
    );
    AnalysisWorker::new(
        "it-worker",
        store,
        queue,
        build_analyzer(&settings.analysis),
        &WorkerConfig::default(),
    )
}

#[tokio::test]
async fn test_upload_then_analysis_reaches_ready() {
    let temp = TempDir::new().unwrap();
    let (service, settings) = open_service(temp.path()).await;

    let call = service
        .create_call("+79001234567", "+79007654321", Utc::now())
        .unwrap();
    assert_eq!(call.status, CallStatus::Created);

    let audio = wav_bytes(1.0);
    let handle = service
        .upload_recording(call.id, "meeting.wav", &mut audio.as_slice())
        .await
        .unwrap();
    assert_eq!(handle.filename, format!("{}.wav", call.id));
    assert!(settings.recordings_dir.join(&handle.filename).exists());

    let view = service.get_call(call.id).unwrap();
    assert_eq!(view.call.status, CallStatus::Processing);
    let recording = view.recording.unwrap();
    assert_eq!(recording.duration_sec, None);
    assert_eq!(recording.transcription, None);

    let worker = worker_for(&settings).await;
    let outcome = worker.run_once().await.unwrap().unwrap();
    assert_eq!(
        outcome,
        JobOutcome::Completed {
            call_id: call.id,
            duration_sec: 1,
        }
    );
    assert!(worker.run_once().await.unwrap().is_none());

    let view = service.get_call(call.id).unwrap();
    assert_eq!(view.call.status, CallStatus::Ready);
    let recording = view.recording.unwrap();
    assert_eq!(recording.duration_sec, Some(1));
    assert_eq!(
        recording.transcription.as_deref(),
        Some("Detected speech fragment: 1000ms sample")
    );
}

#[tokio::test]
async fn test_search_pages_newest_first() {
    let temp = TempDir::new().unwrap();
    let (service, _) = open_service(temp.path()).await;

    let base = Utc::now();
    let mut ids = Vec::new();
    for (n, caller) in ["+79001111111", "+79002222222", "+79003333333"]
        .iter()
        .enumerate()
    {
        let call = service
            .create_call(caller, "+14155550100", base + ChronoDuration::seconds(n as i64))
            .unwrap();
        ids.push(call.id);
        // created_at ordering is what the page follows
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    service
        .create_call("+14155550199", "+14155550100", base)
        .unwrap();

    let page = service.search_calls("+7900", 2, 0).unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].id, ids[2]);
    assert_eq!(page.items[1].id, ids[1]);

    let rest = service.search_calls("+7900", 2, 2).unwrap();
    assert_eq!(rest.total, 3);
    assert_eq!(rest.items.len(), 1);
    assert_eq!(rest.items[0].id, ids[0]);

    let all = service.search_calls("", 100, 0).unwrap();
    assert_eq!(all.total, 4);
}

#[tokio::test]
async fn test_second_upload_conflicts() {
    let temp = TempDir::new().unwrap();
    let (service, settings) = open_service(temp.path()).await;
    let call = service
        .create_call("+79001234567", "+79007654321", Utc::now())
        .unwrap();

    let audio = wav_bytes(0.5);
    service
        .upload_recording(call.id, "a.wav", &mut audio.as_slice())
        .await
        .unwrap();

    let err = service
        .upload_recording(call.id, "b.mp3", &mut audio.as_slice())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::RecordingExists(id) if id == call.id));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let status = service.queue().status().await.unwrap();
    assert_eq!(status.pending, 1);
    assert!(!settings
        .recordings_dir
        .join(format!("{}.mp3", call.id))
        .exists());
}

#[tokio::test]
async fn test_unsupported_extension_leaves_call_untouched() {
    let temp = TempDir::new().unwrap();
    let (service, settings) = open_service(temp.path()).await;
    let call = service
        .create_call("+79001234567", "+79007654321", Utc::now())
        .unwrap();

    let err = service
        .upload_recording(call.id, "notes.txt", &mut b"hello".as_slice())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let view = service.get_call(call.id).unwrap();
    assert_eq!(view.call.status, CallStatus::Created);
    assert!(view.recording.is_none());
    assert_eq!(service.queue().status().await.unwrap().total(), 0);
    assert!(!settings
        .recordings_dir
        .join(format!("{}.txt", call.id))
        .exists());
}

#[tokio::test]
async fn test_download_requires_presign_backend() {
    let temp = TempDir::new().unwrap();
    let (service, _) = open_service(temp.path()).await;
    let call = service
        .create_call("+79001234567", "+79007654321", Utc::now())
        .unwrap();

    let err = service.download_url(call.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotImplemented);
    assert_eq!(err.code(), "presign_not_configured");
}

#[tokio::test]
async fn test_download_with_object_storage() {
    let temp = TempDir::new().unwrap();
    let settings = Settings::rooted_at(temp.path());
    let store = Arc::new(CallStore::open(&settings.database).unwrap());
    let queue = Arc::new(
        JsonlTaskQueue::open(&settings.queue_path, settings.queue.clone())
            .await
            .unwrap(),
    );
    let config = ObjectStorageConfig {
        enabled: true,
        endpoint_url: Some("http://localhost:9000".to_string()),
        access_key: Some("minio".to_string()),
        secret_key: Some("minio123".to_string()),
        bucket: Some("recordings".to_string()),
        ..ObjectStorageConfig::default()
    };
    let storage = Arc::new(
        ObjectStorage::new(LocalStorage::new(&settings.recordings_dir), config).unwrap(),
    );
    let service = CallService::new(store.clone(), storage, queue, Duration::from_secs(3600));

    let call = service
        .create_call("+79001234567", "+79007654321", Utc::now())
        .unwrap();

    let err = service.download_url(call.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Recording row only; the object itself is never fetched
    store
        .create_recording(call.id, &format!("{}.mp3", call.id))
        .unwrap();

    let link = service.download_url(call.id, None).await.unwrap();
    assert_eq!(link.expires_in, 3600);
    assert!(link
        .url
        .starts_with(&format!("http://localhost:9000/recordings/{}.mp3?", call.id)));
    assert!(link.url.contains("X-Amz-Expires=3600"));
}

#[tokio::test]
async fn test_requeue_after_lost_job() {
    let temp = TempDir::new().unwrap();
    let (service, settings) = open_service(temp.path()).await;
    let call = service
        .create_call("+79001234567", "+79007654321", Utc::now())
        .unwrap();

    let audio = wav_bytes(1.0);
    service
        .upload_recording(call.id, "a.wav", &mut audio.as_slice())
        .await
        .unwrap();

    // Job still pending: nothing new is enqueued
    let outcome = service.requeue(call.id).await.unwrap();
    assert!(matches!(outcome, RequeueOutcome::AlreadyQueued { .. }));

    // Lose the job, as if the enqueue had never landed
    tokio::fs::write(&settings.queue_path, b"").await.unwrap();
    let outcome = service.requeue(call.id).await.unwrap();
    assert!(matches!(outcome, RequeueOutcome::Enqueued { .. }));

    let worker = worker_for(&settings).await;
    worker.run_once().await.unwrap().unwrap();
    assert_eq!(
        service.get_call(call.id).unwrap().call.status,
        CallStatus::Ready
    );

    let err = service.requeue(call.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}
