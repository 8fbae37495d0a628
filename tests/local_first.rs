use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parrot::cache::{BackendKind, CachePolicy, KeyParams};
use parrot::config::Config;
use parrot::error::{Error, SyncError, SyncErrorKind};
use parrot::repository::{GetOptions, WriteOptions};
use parrot::sync::{OperationType, SyncHandler, SyncOperation};
use parrot::tts::{AudioSource, Generated};
use parrot::Context;
use serde_json::{json, Value};

fn config(dir: &tempfile::TempDir, online: bool) -> Config {
  let mut config = Config::default();
  config.cache.db_path = Some(dir.path().join("cache.db"));
  config.network.initial_online = online;
  config
}

fn recording_handler(seen: Arc<Mutex<Vec<(OperationType, String)>>>) -> SyncHandler {
  Arc::new(move |op: SyncOperation| {
    seen.lock().unwrap().push((op.op_type, op.key.clone()));
    Box::pin(async { Ok(()) })
  })
}

#[tokio::test(start_paused = true)]
async fn test_offline_writes_reach_the_remote_after_reconnect() {
  let dir = tempfile::tempdir().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let ctx = Context::with_sync_handler(config(&dir, true), recording_handler(seen.clone())).unwrap();
  ctx.start();

  // Offline writes stay local; an explicit update waits in the queue.
  ctx.network.handle_connectivity_change(false);
  ctx.repository.set("draft:1", &json!({"body": "hi"}), WriteOptions::default()).await.unwrap();
  ctx
    .sync
    .queue_operation(parrot::sync::NewOperation::update("draft:1", json!({"body": "hello"})))
    .await;
  assert_eq!(ctx.sync.get_stats().pending, 1);
  assert!(seen.lock().unwrap().is_empty());

  // Local reads work while offline.
  let local = ctx.repository.get::<Value>("draft:1", GetOptions::default()).await.unwrap().unwrap();
  assert_eq!(local.value, json!({"body": "hi"}));

  ctx.network.handle_connectivity_change(true);
  tokio::time::sleep(Duration::from_millis(10)).await;

  assert_eq!(*seen.lock().unwrap(), vec![(OperationType::Update, "draft:1".to_string())]);
  assert_eq!(ctx.sync.get_stats().completed_total, 1);
  ctx.shutdown();
}

#[tokio::test]
async fn test_network_only_read_offline_is_an_error() {
  let dir = tempfile::tempdir().unwrap();
  let ctx = Context::from_config(config(&dir, false)).unwrap();
  ctx.repository.set("k", &1u32, WriteOptions::default()).await.unwrap();

  let err = ctx
    .repository
    .get::<u32>("k", GetOptions::policy(CachePolicy::NetworkOnly))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Offline));
}

#[tokio::test]
async fn test_audio_survives_a_restart() {
  let dir = tempfile::tempdir().unwrap();
  let params = KeyParams::new("Good morning", "warm", "en-GB");

  {
    let ctx = Context::from_config(config(&dir, true)).unwrap();
    assert_eq!(ctx.audio_store.backend(), BackendKind::Persistent);
    let first = ctx
      .tts
      .get_or_generate(&params, || async { Ok(Generated::new(b"OggS".to_vec(), "audio/ogg")) })
      .await
      .unwrap();
    assert_eq!(first.source, AudioSource::Network);
  }

  let ctx = Context::from_config(config(&dir, true)).unwrap();
  let again = ctx
    .tts
    .get_or_generate(&params, || async {
      Err(parrot::error::GeneratorError::failed("should be cached"))
    })
    .await
    .unwrap();
  assert_eq!(again.source, AudioSource::Cache);
  assert_eq!(again.payload, b"OggS");
  assert_eq!(again.meta.mime_type.as_deref(), Some("audio/ogg"));
}

#[tokio::test]
async fn test_coalesced_generation_through_the_context() {
  let dir = tempfile::tempdir().unwrap();
  let ctx = Arc::new(Context::from_config(config(&dir, true)).unwrap());
  let calls = Arc::new(AtomicU32::new(0));

  let mut tasks = Vec::new();
  for _ in 0..5 {
    let ctx = ctx.clone();
    let calls = calls.clone();
    tasks.push(tokio::spawn(async move {
      let params = KeyParams::new("Shared line", "calm", "en-US");
      ctx
        .tts
        .get_or_generate(&params, || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(Generated::new(vec![7; 16], "audio/wav"))
        })
        .await
        .unwrap()
    }));
  }

  let mut merged = 0;
  for task in tasks {
    if task.await.unwrap().merged {
      merged += 1;
    }
  }
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(merged, 4);
  assert_eq!(ctx.observability.snapshot().merged_requests, 4);
}

#[tokio::test(start_paused = true)]
async fn test_failing_remote_ends_failed_and_is_counted() {
  let dir = tempfile::tempdir().unwrap();
  let handler: SyncHandler =
    Arc::new(|_op| Box::pin(async { Err(SyncError::new(SyncErrorKind::Quota, "daily limit reached")) }));
  let ctx = Context::with_sync_handler(config(&dir, true), handler).unwrap();
  ctx.start();

  ctx.repository.delete("gone", WriteOptions::default()).await.unwrap();
  tokio::time::sleep(Duration::from_secs(10)).await;

  let stats = ctx.sync.get_stats();
  assert_eq!(stats.failed, 1);
  assert_eq!(stats.pending, 0);
  assert_eq!(ctx.observability.snapshot().errors_by_kind["quota"], 3);
  ctx.shutdown();
}
