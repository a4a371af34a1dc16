//! Redis-backed implementations of the broker traits.
//!
//! Redis Streams provide exactly the consumer-group, at-least-once,
//! per-message-acknowledgment semantics spec.md §6 and the Glossary
//! describe, so the task and completion streams are backed by `XADD`/
//! `XREADGROUP`/`XACK`. Heartbeats are high-rate and don't need
//! redelivery, so they ride a Redis pub/sub channel instead. The
//! dispatch egress is one pub/sub channel per worker
//! (`"<prefix><workerId>"`), and prediction persistence is the single
//! JSON key spec.md §6 names.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use scheduler_protocol::decision::DispatchEnvelope;
use scheduler_protocol::error::SchedulerError;
use scheduler_protocol::prediction::PredictionSnapshot;
use scheduler_protocol::task::RawTaskRecord;
use scheduler_protocol::worker::{CompletionRecord, HeartbeatRecord};
use tracing::warn;

use crate::traits::{CompletionSource, DispatchSink, HeartbeatEvent, HeartbeatSource, PredictionStore, TaskSource};

fn io_err(context: &str, e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::StreamRead(format!("{context}: {e}"))
}

/// A consumer-group handle onto one Redis stream key.
pub struct RedisTaskSource {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
}

impl RedisTaskSource {
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(redis_url).map_err(|e| io_err("redis client", e))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| io_err("redis connect", e))?;
        let source = Self { conn, stream_key: stream_key.into(), group: group.into(), consumer: consumer.into() };
        source.ensure_group().await?;
        Ok(source)
    }

    async fn ensure_group(&self) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        // BUSYGROUP means the group already exists — not an error for us.
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(io_err("xgroup create", e)),
        }
    }
}

#[async_trait]
impl TaskSource for RedisTaskSource {
    async fn read_batch(
        &self,
        max: usize,
        block: Duration,
    ) -> Result<Vec<RawTaskRecord>, SchedulerError> {
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max)
            .block(block.as_millis() as usize);

        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await
            .map_err(|e| io_err("xreadgroup", e))?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let mut fields = std::collections::HashMap::new();
                for (field, value) in entry.map {
                    if let redis::Value::BulkString(bytes) = value {
                        fields.insert(field, String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                out.push(RawTaskRecord { record_id: entry.id, fields });
            }
        }
        Ok(out)
    }

    async fn ack(&self, record_id: &str) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream_key, &self.group, &[record_id])
            .await
            .map_err(|e| io_err("xack", e))?;
        Ok(())
    }
}

/// Pub/sub based heartbeat source. Heartbeats are a lossy, high-rate
/// telemetry stream — at-least-once redelivery is neither needed nor
/// wanted, so this rides Redis pub/sub rather than a consumer group.
pub struct RedisHeartbeatSource {
    rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<HeartbeatEvent>>,
    cancel: tokio::sync::watch::Sender<bool>,
}

impl RedisHeartbeatSource {
    pub async fn subscribe(redis_url: &str, channel: &str) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(redis_url).map_err(|e| io_err("redis client", e))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| io_err("redis pubsub connect", e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| io_err("redis subscribe", e))?;

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            let _ = tx.send(HeartbeatEvent::End).await;
                            return;
                        }
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => {
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        let _ = tx.send(HeartbeatEvent::Error(e.to_string())).await;
                                        continue;
                                    }
                                };
                                match serde_json::from_str::<HeartbeatRecord>(&payload) {
                                    Ok(record) => {
                                        if tx.send(HeartbeatEvent::Data(record)).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        let _ = tx.send(HeartbeatEvent::Error(e.to_string())).await;
                                    }
                                }
                            }
                            None => {
                                let _ = tx.send(HeartbeatEvent::End).await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { rx: tokio::sync::Mutex::new(rx), cancel: cancel_tx })
    }
}

#[async_trait]
impl HeartbeatSource for RedisHeartbeatSource {
    async fn next_event(&self) -> HeartbeatEvent {
        let mut rx = self.rx.lock().await;
        rx.recv().await.unwrap_or(HeartbeatEvent::End)
    }

    async fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Consumer-group handle onto the completion stream. Reuses the same
/// read/ack shape as `RedisTaskSource`, with completion records parsed
/// directly instead of staying as raw fields, since the feedback
/// pipeline acks internally rather than deferring to a caller.
pub struct RedisCompletionSource {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
    cancelled: std::sync::atomic::AtomicBool,
}

impl RedisCompletionSource {
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(redis_url).map_err(|e| io_err("redis client", e))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| io_err("redis connect", e))?;
        let stream_key = stream_key.into();
        let group = group.into();
        let mut setup_conn = conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream_key)
            .arg(&group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut setup_conn)
            .await;
        if let Err(e) = result {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(io_err("xgroup create", e));
            }
        }
        Ok(Self { conn, stream_key, group, consumer: consumer.into(), cancelled: std::sync::atomic::AtomicBool::new(false) })
    }
}

#[async_trait]
impl CompletionSource for RedisCompletionSource {
    async fn next(&self) -> Option<CompletionRecord> {
        if self.cancelled.load(std::sync::atomic::Ordering::Relaxed) {
            return None;
        }
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(1000);

        let reply: redis::streams::StreamReadReply =
            match conn.xread_options(&[&self.stream_key], &[">"], &opts).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "completion stream read failed");
                    return None;
                }
            };

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                if let Some(redis::Value::BulkString(bytes)) = entry.map.get("payload") {
                    if let Ok(record) = serde_json::from_slice::<CompletionRecord>(bytes) {
                        let _: redis::RedisResult<i64> =
                            conn.xack(&self.stream_key, &self.group, &[&entry.id]).await;
                        return Some(record);
                    }
                }
            }
        }
        None
    }

    async fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Publishes dispatch envelopes on `"<prefix><workerId>"` pub/sub
/// channels (spec.md §6).
pub struct RedisDispatchSink {
    conn: ConnectionManager,
    channel_prefix: String,
}

impl RedisDispatchSink {
    pub async fn connect(redis_url: &str, channel_prefix: impl Into<String>) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(redis_url).map_err(|e| io_err("redis client", e))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| io_err("redis connect", e))?;
        Ok(Self { conn, channel_prefix: channel_prefix.into() })
    }
}

#[async_trait]
impl DispatchSink for RedisDispatchSink {
    async fn publish(&self, worker_id: &str, envelope: &DispatchEnvelope) -> Result<(), SchedulerError> {
        let channel = format!("{}{}", self.channel_prefix, worker_id);
        let payload = serde_json::to_string(envelope)
            .map_err(|e| SchedulerError::PublishFailed { worker_id: worker_id.to_string(), source: e.to_string() })?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, i64>(&channel, payload)
            .await
            .map_err(|e| SchedulerError::PublishFailed { worker_id: worker_id.to_string(), source: e.to_string() })?;
        Ok(())
    }
}

/// Single-key JSON snapshot/load (spec.md §4.4, §6).
pub struct RedisPredictionStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisPredictionStore {
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(redis_url).map_err(|e| io_err("redis client", e))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| io_err("redis connect", e))?;
        Ok(Self { conn, key: key.into() })
    }
}

#[async_trait]
impl PredictionStore for RedisPredictionStore {
    async fn save(&self, snapshot: &PredictionSnapshot) -> Result<(), SchedulerError> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| SchedulerError::PersistenceUnavailable(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&self.key, payload)
            .await
            .map_err(|e| SchedulerError::PersistenceUnavailable(e.to_string()))
    }

    async fn load(&self) -> Result<Option<PredictionSnapshot>, SchedulerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(&self.key)
            .await
            .map_err(|e| SchedulerError::PersistenceUnavailable(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| SchedulerError::PersistenceUnavailable(e.to_string())),
        }
    }
}
