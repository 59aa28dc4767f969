//! Redis broker.
//!
//! Key layout per queue (`{prefix}:queue:{name}:...`):
//!
//! - `ready`: list of inline bodies, or ids for lazy queues
//! - `bodies`: hash of id to body for lazy, delayed and in-flight messages
//! - `delayed`: sorted set of ids scored by due time
//! - `processing`: sorted set of in-flight ids scored by visibility deadline
//! - `dead`: list of dead letter entries, capped
//! - `job:{job_id}`: dedup reservation holding the message id
//! - `consumer`: single-active-consumer lease
//!
//! An in-flight message whose visibility deadline passes is put back at the
//! head of the ready list on persistent queues and dropped on transient ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fred::clients::Client;
use fred::error::{Error as RedisError, ErrorKind as RedisErrorKind};
use fred::interfaces::{ClientLike, KeysInterface, ListInterface, LuaInterface, SortedSetsInterface};
use fred::types::{Expiration, SetOptions};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Broker, BrokerError, PublishStatus, QueueDepth};
use crate::delayed::RedisDelayScheduler;
use crate::descriptor::QueueDescriptor;
use crate::job::JobMessage;
use crate::retry::DeadLetterEntry;

const PUBLISH_SCRIPT: &str = r"
if ARGV[4] == '1' then
    if not redis.call('SET', KEYS[3], ARGV[1], 'NX', 'PX', ARGV[5]) then
        return 0
    end
end
if ARGV[3] == '1' then
    redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
    redis.call('RPUSH', KEYS[1], ARGV[1])
else
    redis.call('RPUSH', KEYS[1], ARGV[2])
end
return 1
";

const RESERVE_SCRIPT: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    if ARGV[3] == '1' then
        redis.call('LPUSH', KEYS[1], id)
    else
        local body = redis.call('HGET', KEYS[3], id)
        if body then
            local job_id = cjson.decode(body)['job_id']
            if type(job_id) == 'string' then
                redis.call('DEL', ARGV[4] .. job_id)
            end
        end
        redis.call('HDEL', KEYS[3], id)
    end
end
local entry = redis.call('LPOP', KEYS[1])
if not entry then
    return false
end
local id = entry
if string.sub(entry, 1, 1) == '{' then
    id = cjson.decode(entry)['id']
    redis.call('HSET', KEYS[3], id, entry)
end
local body = redis.call('HGET', KEYS[3], id)
if not body then
    return false
end
redis.call('ZADD', KEYS[2], ARGV[2], id)
return body
";

const ACK_SCRIPT: &str = r"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
if ARGV[2] == '1' and redis.call('GET', KEYS[3]) == ARGV[1] then
    redis.call('DEL', KEYS[3])
end
return 1
";

const DEAD_LETTER_SCRIPT: &str = r"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[2])
redis.call('LTRIM', KEYS[3], -tonumber(ARGV[4]), -1)
if ARGV[3] == '1' and redis.call('GET', KEYS[4]) == ARGV[1] then
    redis.call('DEL', KEYS[4])
end
return 1
";

const CLAIM_SCRIPT: &str = r"
local holder = redis.call('GET', KEYS[1])
if not holder then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
if holder == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Redis broker tuning.
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Key prefix.
    pub prefix: String,
    /// How long a reserved message may stay unacknowledged.
    pub visibility_timeout: Duration,
    /// Lifetime of a job-id reservation if it is never released.
    pub job_id_ttl: Duration,
    /// Dead letters kept per queue.
    pub dead_letter_cap: u32,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            prefix: "blockfeed".to_string(),
            visibility_timeout: Duration::from_secs(300),
            job_id_ttl: Duration::from_secs(7 * 24 * 3600),
            dead_letter_cap: 1000,
        }
    }
}

struct QueueKeys {
    ready: String,
    bodies: String,
    delayed: String,
    processing: String,
    dead: String,
    consumer: String,
    job_prefix: String,
}

impl QueueKeys {
    fn job(&self, job_id: &str) -> String {
        format!("{}{job_id}", self.job_prefix)
    }
}

/// Broker on Redis.
pub struct RedisBroker {
    client: Client,
    scheduler: RedisDelayScheduler,
    config: RedisBrokerConfig,
    declared: RwLock<HashMap<String, QueueDescriptor>>,
}

fn command_error(err: RedisError) -> BrokerError {
    match err.kind() {
        RedisErrorKind::IO | RedisErrorKind::Canceled | RedisErrorKind::Timeout => {
            BrokerError::Unavailable(err.to_string())
        }
        _ => BrokerError::Command(err.to_string()),
    }
}

impl RedisBroker {
    /// Create a broker on a connected client.
    #[must_use]
    pub fn new(client: Client, config: RedisBrokerConfig) -> Self {
        Self {
            scheduler: RedisDelayScheduler::new(client.clone()),
            client,
            config,
            declared: RwLock::new(HashMap::new()),
        }
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        let base = format!("{}:queue:{queue}", self.config.prefix);
        QueueKeys {
            ready: format!("{base}:ready"),
            bodies: format!("{base}:bodies"),
            delayed: format!("{base}:delayed"),
            processing: format!("{base}:processing"),
            dead: format!("{base}:dead"),
            consumer: format!("{base}:consumer"),
            job_prefix: format!("{base}:job:"),
        }
    }

    /// (lazy, persistent) of a queue. Undeclared queues are inline and persistent.
    async fn queue_flags(&self, queue: &str) -> (bool, bool) {
        self.declared
            .read()
            .await
            .get(queue)
            .map_or((false, true), |d| (d.lazy, d.persistent))
    }

    async fn publish_delayed(
        &self,
        keys: &QueueKeys,
        message: &JobMessage,
        body: String,
    ) -> Result<PublishStatus, BrokerError> {
        if let Some(job_id) = &message.job_id {
            let reserved: Option<String> = self
                .client
                .set(
                    keys.job(job_id),
                    message.id.as_str(),
                    Some(Expiration::PX(self.config.job_id_ttl.as_millis() as i64)),
                    Some(SetOptions::NX),
                    false,
                )
                .await
                .map_err(command_error)?;
            if reserved.is_none() {
                return Ok(PublishStatus::Duplicate);
            }
        }

        let scheduled = self
            .scheduler
            .schedule(&keys.delayed, &keys.bodies, &message.id, body, message.delay())
            .await;

        if let Err(e) = scheduled {
            if let Some(job_id) = &message.job_id {
                let _: Result<i64, _> = self.client.del(keys.job(job_id)).await;
            }
            return Err(e);
        }

        Ok(PublishStatus::Queued)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare(&self, descriptor: &QueueDescriptor) -> Result<(), BrokerError> {
        debug!(
            queue = %descriptor.name,
            lazy = descriptor.lazy,
            persistent = descriptor.persistent,
            "Declaring queue"
        );
        self.declared
            .write()
            .await
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    async fn publish(&self, message: JobMessage) -> Result<PublishStatus, BrokerError> {
        let keys = self.keys(&message.queue);
        let body = serde_json::to_string(&message)?;

        if !message.delay().is_zero() {
            return self.publish_delayed(&keys, &message, body).await;
        }

        let (lazy, _) = self.queue_flags(&message.queue).await;
        let job_key = message
            .job_id
            .as_deref()
            .map_or_else(|| keys.job(""), |id| keys.job(id));

        let stored: i64 = self
            .client
            .eval(
                PUBLISH_SCRIPT,
                vec![keys.ready, keys.bodies, job_key],
                vec![
                    message.id.clone(),
                    body,
                    flag(lazy),
                    flag(message.job_id.is_some()),
                    self.config.job_id_ttl.as_millis().to_string(),
                ],
            )
            .await
            .map_err(command_error)?;

        Ok(if stored == 1 {
            PublishStatus::Queued
        } else {
            PublishStatus::Duplicate
        })
    }

    async fn reserve(&self, queue: &str) -> Result<Option<JobMessage>, BrokerError> {
        let keys = self.keys(queue);
        let (_, persistent) = self.queue_flags(queue).await;

        self.scheduler.promote(&keys.delayed, &keys.ready).await?;

        let now = Utc::now().timestamp_millis();
        let deadline = now + self.config.visibility_timeout.as_millis() as i64;
        let body: Option<String> = self
            .client
            .eval(
                RESERVE_SCRIPT,
                vec![keys.ready, keys.processing, keys.bodies],
                vec![
                    now.to_string(),
                    deadline.to_string(),
                    flag(persistent),
                    keys.job_prefix,
                ],
            )
            .await
            .map_err(command_error)?;

        body.map(|raw| serde_json::from_str(&raw).map_err(BrokerError::from))
            .transpose()
    }

    async fn ack(&self, message: &JobMessage) -> Result<(), BrokerError> {
        let keys = self.keys(&message.queue);
        let job_key = keys.job(message.job_id.as_deref().unwrap_or_default());

        let _: i64 = self
            .client
            .eval(
                ACK_SCRIPT,
                vec![keys.processing, keys.bodies, job_key],
                vec![message.id.clone(), flag(message.job_id.is_some())],
            )
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn retry(&self, message: JobMessage, delay: Duration) -> Result<(), BrokerError> {
        let keys = self.keys(&message.queue);
        let body = serde_json::to_string(&message)?;

        // Schedule before leaving the processing set so a crash in between
        // redelivers instead of losing the message.
        self.scheduler
            .schedule(&keys.delayed, &keys.bodies, &message.id, body, delay)
            .await?;
        let _: i64 = self
            .client
            .zrem(&keys.processing, message.id.as_str())
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn dead_letter(&self, entry: DeadLetterEntry) -> Result<(), BrokerError> {
        let keys = self.keys(&entry.message.queue);
        let job_key = keys.job(entry.message.job_id.as_deref().unwrap_or_default());
        let raw = serde_json::to_string(&entry)?;

        let _: i64 = self
            .client
            .eval(
                DEAD_LETTER_SCRIPT,
                vec![keys.processing, keys.bodies, keys.dead, job_key],
                vec![
                    entry.message.id.clone(),
                    raw,
                    flag(entry.message.job_id.is_some()),
                    self.config.dead_letter_cap.to_string(),
                ],
            )
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn claim_consumer(
        &self,
        queue: &str,
        consumer: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let keys = self.keys(queue);
        let claimed: i64 = self
            .client
            .eval(
                CLAIM_SCRIPT,
                vec![keys.consumer],
                vec![consumer.to_string(), ttl.as_millis().to_string()],
            )
            .await
            .map_err(command_error)?;
        Ok(claimed == 1)
    }

    async fn release_consumer(&self, queue: &str, consumer: &str) -> Result<(), BrokerError> {
        let keys = self.keys(queue);
        let _: i64 = self
            .client
            .eval(RELEASE_SCRIPT, vec![keys.consumer], vec![consumer.to_string()])
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, BrokerError> {
        let keys = self.keys(queue);

        let ready: u64 = self.client.llen(&keys.ready).await.map_err(command_error)?;
        let delayed: u64 = self.client.zcard(&keys.delayed).await.map_err(command_error)?;
        let in_flight: u64 = self
            .client
            .zcard(&keys.processing)
            .await
            .map_err(command_error)?;
        let dead: u64 = self.client.llen(&keys.dead).await.map_err(command_error)?;

        Ok(QueueDepth {
            ready,
            delayed,
            in_flight,
            dead,
        })
    }

    async fn dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let keys = self.keys(queue);
        let raw: Vec<String> = self
            .client
            .lrange(&keys.dead, -(limit as i64), -1)
            .await
            .map_err(command_error)?;

        raw.iter()
            .rev()
            .map(|entry| serde_json::from_str(entry).map_err(BrokerError::from))
            .collect()
    }

    async fn dedicated(&self) -> Result<Option<Arc<dyn Broker>>, BrokerError> {
        let client = self.client.clone_new();
        client.init().await.map_err(command_error)?;
        info!("Opened dedicated broker connection");

        let broker = Self::new(client, self.config.clone());
        *broker.declared.write().await = self.declared.read().await.clone();
        Ok(Some(Arc::new(broker)))
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}
