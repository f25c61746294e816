use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use cmo_core::traits::{
    ComponentHealth, Delivery, IdempotencyStore, ObjectStore, SubscribeOptions, Subscription,
    Transport, TransportStats,
};
use cmo_core::utils::sha256_hex;
use cmo_core::{partition_key, well_known, Envelope, Topic, TransportError};

/// Stream field holding the envelope JSON.
const FIELD_DATA: &str = "data";
/// Stream field holding the partition key.
const FIELD_PARTITION: &str = "partition";
/// Stream field holding the delivery attempt.
const FIELD_ATTEMPT: &str = "attempt";
/// Stream field holding the DLQ reason.
const FIELD_DLQ_REASON: &str = "dlq_reason";

/// Deadline applied to every single broker command.
const OP_TIMEOUT: Duration = Duration::from_secs(10);
/// Block interval of consumer reads; short so that cancellation is prompt.
const READ_BLOCK_MS: usize = 500;
/// Entries fetched per consumer read.
const READ_COUNT: usize = 16;
/// Payload key marking an externalized payload.
const BLOB_REF_KEY: &str = "blob_ref";

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    rejected: AtomicU64,
}

/// The live broker transport: one topic maps onto one Redis stream, one
/// logical subscriber role onto one consumer group.
///
/// Delivery semantics: a consumer owns an entry from `XREADGROUP` until it
/// acks; `nack` acks the original entry and re-appends a copy with a bumped
/// attempt counter; `reject` routes the entry to `<topic>.dlq` with a
/// reason field. Payloads above the inline threshold are externalized to
/// the object store and carried by reference.
pub struct RedisStreamTransport {
    client: redis::Client,
    group_prefix: String,
    conn: Mutex<Option<ConnectionManager>>,
    subscriber_tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    blob: Option<Arc<dyn ObjectStore>>,
    max_inline_bytes: usize,
}

impl std::fmt::Debug for RedisStreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamTransport")
            .field("group_prefix", &self.group_prefix)
            .field("max_inline_bytes", &self.max_inline_bytes)
            .finish_non_exhaustive()
    }
}

fn publish_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::PublishFailed(e.to_string())
}

fn subscribe_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::SubscribeFailed(e.to_string())
}

async fn with_deadline<T, F>(fut: F) -> Result<T, TransportError>
where
    F: std::future::Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(OP_TIMEOUT, fut)
        .await
        .map_err(|_| TransportError::Timeout(OP_TIMEOUT))?
}

impl RedisStreamTransport {
    /// Build a transport for `url`. Connection happens in `connect`.
    pub fn new(
        url: &str,
        group_prefix: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(subscribe_err)?;
        Ok(Self {
            client,
            group_prefix: group_prefix.into(),
            conn: Mutex::new(None),
            subscriber_tasks: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            blob: None,
            max_inline_bytes: usize::MAX,
        })
    }

    /// Externalize payloads above `max_inline_bytes` to `store`.
    pub fn with_blob_store(mut self, store: Arc<dyn ObjectStore>, max_inline_bytes: usize) -> Self {
        self.blob = Some(store);
        self.max_inline_bytes = max_inline_bytes;
        self
    }

    /// The consumer group name for a logical subscriber role.
    pub fn group_name(&self, role: &str) -> String {
        format!("{}:{}", self.group_prefix, role)
    }

    async fn manager(&self) -> Result<ConnectionManager, TransportError> {
        self.conn
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    /// Swap an oversized payload for an object-store reference.
    async fn externalize(&self, envelope: &Envelope) -> Result<Envelope, TransportError> {
        let Some(blob) = &self.blob else {
            return Ok(envelope.clone());
        };
        let payload_bytes =
            serde_json::to_vec(&envelope.payload).map_err(publish_err)?;
        if payload_bytes.len() <= self.max_inline_bytes {
            return Ok(envelope.clone());
        }
        let key = format!("payload/{}", sha256_hex(&payload_bytes));
        blob.put(&key, &payload_bytes)
            .await
            .map_err(publish_err)?;
        let mut slim = envelope.clone();
        slim.payload = serde_json::json!({ BLOB_REF_KEY: key });
        Ok(slim)
    }

    /// Resolve an object-store reference back into the payload.
    async fn rehydrate(&self, envelope: &mut Envelope) -> Result<(), TransportError> {
        let Some(blob) = &self.blob else {
            return Ok(());
        };
        let Some(reference) = envelope
            .payload
            .as_object()
            .filter(|o| o.len() == 1)
            .and_then(|o| o.get(BLOB_REF_KEY))
            .and_then(Value::as_str)
        else {
            return Ok(());
        };
        let bytes = blob.get(reference).await.map_err(subscribe_err)?;
        envelope.payload = serde_json::from_slice(&bytes).map_err(subscribe_err)?;
        Ok(())
    }

    async fn append(
        &self,
        conn: &mut ConnectionManager,
        stream: &str,
        envelope: &Envelope,
        attempt: u32,
        dlq_reason: Option<&str>,
    ) -> Result<String, TransportError> {
        let data = serde_json::to_string(envelope).map_err(publish_err)?;
        let partition = partition_key(
            &envelope.meta.tenant,
            &envelope.meta.project,
            Some(&envelope.meta.trace_id),
        );
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream)
            .arg("*")
            .arg(FIELD_DATA)
            .arg(data)
            .arg(FIELD_PARTITION)
            .arg(partition)
            .arg(FIELD_ATTEMPT)
            .arg(attempt);
        if let Some(reason) = dlq_reason {
            cmd.arg(FIELD_DLQ_REASON).arg(reason);
        }
        let id: String = with_deadline(async {
            cmd.query_async(conn).await.map_err(publish_err)
        })
        .await?;
        Ok(id)
    }

    async fn ensure_group(
        &self,
        conn: &mut ConnectionManager,
        stream: &str,
        group: &str,
    ) -> Result<(), TransportError> {
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(subscribe_err(e)),
        }
    }

    async fn xack(
        &self,
        conn: &mut ConnectionManager,
        stream: &str,
        group: &str,
        receipt: &str,
    ) -> Result<(), TransportError> {
        with_deadline(async {
            redis::cmd("XACK")
                .arg(stream)
                .arg(group)
                .arg(receipt)
                .query_async::<i64>(conn)
                .await
                .map(|_| ())
                .map_err(publish_err)
        })
        .await
    }
}

fn entry_field<T: redis::FromRedisValue>(
    map: &std::collections::HashMap<String, redis::Value>,
    field: &str,
) -> Option<T> {
    map.get(field).and_then(|v| redis::from_redis_value(v).ok())
}

#[async_trait]
impl Transport for RedisStreamTransport {
    #[instrument(skip(self))]
    async fn connect(&self) -> Result<(), TransportError> {
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(subscribe_err)?;
        let mut probe = manager.clone();
        with_deadline(async {
            redis::cmd("PING")
                .query_async::<String>(&mut probe)
                .await
                .map_err(subscribe_err)
        })
        .await?;
        *self.conn.lock().await = Some(manager);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        *self.conn.lock().await = None;
        for task in self.subscriber_tasks.lock().await.drain(..) {
            task.abort();
        }
        Ok(())
    }

    #[instrument(skip(self, envelope), fields(topic = %topic, message_id = %envelope.meta.message_id))]
    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<String, TransportError> {
        let mut conn = self.manager().await?;
        let outgoing = self.externalize(envelope).await?;
        let id = self
            .append(&mut conn, topic.name(), &outgoing, 1, None)
            .await?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    #[instrument(skip(self), fields(topic = %topic, group = %options.group))]
    async fn subscribe(
        &self,
        topic: &Topic,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError> {
        let mut conn = self.manager().await?;
        self.ensure_group(&mut conn, topic.name(), &options.group)
            .await?;

        // Blocking reads get a dedicated connection so they cannot stall
        // the shared multiplexed manager.
        let mut read_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(subscribe_err)?;

        let (tx, rx) = mpsc::channel(options.max_pending.max(1));
        let stream = topic.name().to_string();
        let topic = topic.clone();
        let group = options.group.clone();
        let consumer = options.consumer.clone();
        let blob = self.blob.clone();
        let counters = self.counters.clone();

        let task = tokio::spawn(async move {
            loop {
                let reply: Result<Option<StreamReadReply>, redis::RedisError> =
                    redis::cmd("XREADGROUP")
                        .arg("GROUP")
                        .arg(&group)
                        .arg(&consumer)
                        .arg("COUNT")
                        .arg(READ_COUNT)
                        .arg("BLOCK")
                        .arg(READ_BLOCK_MS)
                        .arg("STREAMS")
                        .arg(&stream)
                        .arg(">")
                        .query_async(&mut read_conn)
                        .await;
                let reply = match reply {
                    Ok(Some(reply)) => reply,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(stream, error = %e, "consumer read failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                for key in reply.keys {
                    for entry in key.ids {
                        let Some(data) = entry_field::<String>(&entry.map, FIELD_DATA) else {
                            warn!(stream, id = %entry.id, "stream entry without data field");
                            continue;
                        };
                        let mut envelope: Envelope = match serde_json::from_str(&data) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!(stream, id = %entry.id, error = %e, "undecodable entry");
                                continue;
                            }
                        };
                        if let Some(blob) = &blob {
                            if let Some(reference) = envelope
                                .payload
                                .as_object()
                                .filter(|o| o.len() == 1)
                                .and_then(|o| o.get(BLOB_REF_KEY))
                                .and_then(Value::as_str)
                                .map(str::to_string)
                            {
                                match blob.get(&reference).await {
                                    Ok(bytes) => match serde_json::from_slice(&bytes) {
                                        Ok(payload) => envelope.payload = payload,
                                        Err(e) => {
                                            warn!(reference, error = %e, "bad blob payload");
                                            continue;
                                        }
                                    },
                                    Err(e) => {
                                        warn!(reference, error = %e, "blob fetch failed");
                                        continue;
                                    }
                                }
                            }
                        }
                        let attempt = entry_field::<String>(&entry.map, FIELD_ATTEMPT)
                            .and_then(|a| a.parse().ok())
                            .unwrap_or(1);
                        let delivery = Delivery {
                            topic: topic.clone(),
                            envelope,
                            receipt: entry.id.clone(),
                            group: group.clone(),
                            attempt,
                        };
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                        // A full channel pauses reads: flow control.
                        if tx.send(delivery).await.is_err() {
                            debug!(stream, "subscription receiver dropped, stopping");
                            return;
                        }
                    }
                }
            }
        });
        self.subscriber_tasks.lock().await.push(task);

        Ok(Subscription { deliveries: rx })
    }

    #[instrument(skip(self, envelope), fields(topic = %topic))]
    async fn request(
        &self,
        topic: &Topic,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        let mut request = envelope.clone();
        let correlation = request.meta.message_id.clone();
        request.meta.correlation_id = Some(correlation.clone());
        let reply_topic = well_known::replies(
            &request.meta.tenant,
            &request.meta.project,
            &correlation,
        );

        self.publish(topic, &request).await?;

        let mut read_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(subscribe_err)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_id = "0-0".to_string();
        let result = loop {
            if tokio::time::Instant::now() >= deadline {
                break Err(TransportError::Timeout(timeout));
            }
            let reply: Result<Option<StreamReadReply>, redis::RedisError> = redis::cmd("XREAD")
                .arg("COUNT")
                .arg(READ_COUNT)
                .arg("BLOCK")
                .arg(READ_BLOCK_MS)
                .arg("STREAMS")
                .arg(reply_topic.name())
                .arg(&last_id)
                .query_async(&mut read_conn)
                .await;
            let reply = match reply {
                Ok(Some(reply)) => reply,
                Ok(None) => continue,
                Err(e) => break Err(subscribe_err(e)),
            };
            let mut found = None;
            for key in reply.keys {
                for entry in key.ids {
                    last_id = entry.id.clone();
                    let Some(data) = entry_field::<String>(&entry.map, FIELD_DATA) else {
                        continue;
                    };
                    if let Ok(candidate) = serde_json::from_str::<Envelope>(&data) {
                        if candidate.meta.correlation_id.as_deref() == Some(&correlation) {
                            found = Some(candidate);
                        }
                    }
                }
            }
            if let Some(response) = found {
                break Ok(response);
            }
        };

        // The reply stream was for this exchange only.
        let mut conn = self.manager().await?;
        let _: Result<i64, redis::RedisError> = redis::cmd("DEL")
            .arg(reply_topic.name())
            .query_async(&mut conn)
            .await;

        match result {
            Ok(mut response) => {
                self.rehydrate(&mut response).await?;
                Ok(response)
            }
            err => err,
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut conn = self.manager().await?;
        self.xack(&mut conn, delivery.topic.name(), &delivery.group, &delivery.receipt)
            .await?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut conn = self.manager().await?;
        self.xack(&mut conn, delivery.topic.name(), &delivery.group, &delivery.receipt)
            .await?;
        self.append(
            &mut conn,
            delivery.topic.name(),
            &delivery.envelope,
            delivery.attempt + 1,
            None,
        )
        .await?;
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(topic = %delivery.topic))]
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        let mut conn = self.manager().await?;
        self.xack(&mut conn, delivery.topic.name(), &delivery.group, &delivery.receipt)
            .await?;
        self.append(
            &mut conn,
            delivery.topic.dlq().name(),
            &delivery.envelope,
            delivery.attempt,
            Some(reason),
        )
        .await?;
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn create_topic(&self, topic: &Topic) -> Result<(), TransportError> {
        let mut conn = self.manager().await?;
        self.ensure_group(&mut conn, topic.name(), &self.group_name("init"))
            .await
    }

    async fn delete_topic(&self, topic: &Topic) -> Result<(), TransportError> {
        let mut conn = self.manager().await?;
        with_deadline(async {
            conn.del::<_, i64>(topic.name())
                .await
                .map(|_| ())
                .map_err(publish_err)
        })
        .await
    }

    async fn purge_topic(&self, topic: &Topic) -> Result<u64, TransportError> {
        let mut conn = self.manager().await?;
        with_deadline(async {
            let len: u64 = redis::cmd("XLEN")
                .arg(topic.name())
                .query_async(&mut conn)
                .await
                .map_err(publish_err)?;
            redis::cmd("XTRIM")
                .arg(topic.name())
                .arg("MAXLEN")
                .arg(0)
                .query_async::<i64>(&mut conn)
                .await
                .map_err(publish_err)?;
            Ok(len)
        })
        .await
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        let c = &self.counters;
        Ok(TransportStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            nacked: c.nacked.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> Result<ComponentHealth, TransportError> {
        let Ok(mut conn) = self.manager().await else {
            return Ok(ComponentHealth::unhealthy("not connected"));
        };
        let pong: Result<String, _> = tokio::time::timeout(
            Duration::from_secs(2),
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .unwrap_or_else(|_| {
            Err(redis::RedisError::from(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "ping timed out",
            )))
        });
        Ok(match pong {
            Ok(_) => ComponentHealth::healthy("broker reachable"),
            Err(e) => ComponentHealth::unhealthy(format!("ping failed: {e}")),
        })
    }
}

/// Idempotency store on the broker's KV surface: `SET NX EX` is the atomic
/// check-and-set.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisIdempotencyStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisIdempotencyStore {
    /// Connect a store at `url`, namespacing keys under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(subscribe_err)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(subscribe_err)?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.prefix, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, TransportError> {
        let mut conn = self.conn.clone();
        let set: Option<String> = with_deadline(async {
            redis::cmd("SET")
                .arg(self.key(key))
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(publish_err)
        })
        .await?;
        Ok(set.is_some())
    }

    async fn remove(&self, key: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        with_deadline(async {
            conn.del::<_, i64>(self.key(key))
                .await
                .map(|_| ())
                .map_err(publish_err)
        })
        .await
    }
}
