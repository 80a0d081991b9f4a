use async_trait::async_trait;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::{AsyncCommands, ErrorKind, RedisError};

use crate::error::PublishError;
use crate::publisher::Publisher;
use crate::types::{Attributes, DeliveryId};

const PAYLOAD_FIELD: &str = "payload";
const ATTRIBUTE_FIELD_PREFIX: &str = "attr:";

/// Appends each message to a Redis stream with `XADD`.
///
/// The payload goes in the `payload` field and each attribute in an
/// `attr:<name>` field. The stream entry id is the delivery id. Wrap in a
/// [`PublisherSink`](crate::PublisherSink) to use a stream as the dead-letter
/// queue, and [`read`](Self::read) it back for replay.
#[derive(Debug, Clone)]
pub struct RedisStreamPublisher {
    client: redis::Client,
    stream: String,
    max_len: Option<usize>,
}

impl RedisStreamPublisher {
    pub fn new(client: redis::Client, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
            max_len: None,
        }
    }

    /// Trim the stream to roughly `max_len` entries on every append.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Oldest `count` entries as `(id, payload, attributes)`.
    pub async fn read(
        &self,
        count: usize,
    ) -> Result<Vec<(DeliveryId, Vec<u8>, Attributes)>, PublishError> {
        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(classify_redis)?;
        let reply: StreamRangeReply = conn
            .xrange_count(&self.stream, "-", "+", count)
            .await
            .map_err(classify_redis)?;

        let entries = reply
            .ids
            .into_iter()
            .map(|entry| {
                let mut payload = Vec::new();
                let mut attributes = Attributes::new();
                for (field, value) in &entry.map {
                    let Ok(bytes) = redis::from_redis_value::<Vec<u8>>(value) else {
                        continue;
                    };
                    if field == PAYLOAD_FIELD {
                        payload = bytes;
                    } else if let Some(name) = field.strip_prefix(ATTRIBUTE_FIELD_PREFIX) {
                        attributes.insert(
                            name.to_string(),
                            String::from_utf8_lossy(&bytes).into_owned(),
                        );
                    }
                }
                (DeliveryId(entry.id), payload, attributes)
            })
            .collect();
        Ok(entries)
    }

    /// Delete an entry, e.g. after a successful replay.
    pub async fn remove(&self, id: &DeliveryId) -> Result<(), PublishError> {
        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(classify_redis)?;
        let _: usize = conn
            .xdel(&self.stream, &[id.0.as_str()])
            .await
            .map_err(classify_redis)?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for RedisStreamPublisher {
    async fn publish(
        &self,
        payload: &[u8],
        attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        let mut fields: Vec<(String, Vec<u8>)> = Vec::with_capacity(attributes.len() + 1);
        fields.push((PAYLOAD_FIELD.to_string(), payload.to_vec()));
        for (name, value) in attributes {
            fields.push((
                format!("{ATTRIBUTE_FIELD_PREFIX}{name}"),
                value.as_bytes().to_vec(),
            ));
        }

        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(classify_redis)?;

        let result: redis::RedisResult<String> = match self.max_len {
            Some(max_len) => {
                conn.xadd_maxlen(&self.stream, StreamMaxlen::Approx(max_len), "*", &fields)
                    .await
            }
            None => conn.xadd(&self.stream, "*", &fields).await,
        };

        result.map(DeliveryId).map_err(classify_redis)
    }
}

fn classify_redis(err: RedisError) -> PublishError {
    if err.kind() == ErrorKind::AuthenticationFailed
        || matches!(err.code(), Some("NOAUTH") | Some("WRONGPASS") | Some("NOPERM"))
    {
        return PublishError::auth(err.to_string());
    }
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        return PublishError::connection(err.to_string());
    }
    match err.kind() {
        ErrorKind::TypeError | ErrorKind::InvalidClientConfig => {
            PublishError::validation(err.to_string())
        }
        ErrorKind::BusyLoadingError | ErrorKind::TryAgain | ErrorKind::ClusterDown => {
            PublishError::connection(err.to_string())
        }
        _ => PublishError::publish(err.to_string()),
    }
}
