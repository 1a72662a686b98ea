//! Redis Streams backend.
//!
//! The exchange is a stream key and each queue is a consumer group on that
//! stream. Reads use `XREADGROUP ... NOACK`, so entries are never left
//! pending for redelivery.

use super::{BrokerChannel, BrokerConnector, BrokerEnvelope, BrokerError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use std::time::Duration;
use tracing::warn;

/// Approximate cap on stream length
const STREAM_MAXLEN: usize = 100_000;

pub struct RedisStreamsConnector {
    client: redis::Client,
    consumer_name: String,
    block: Duration,
    batch_size: usize,
}

impl RedisStreamsConnector {
    pub fn new(redis_url: &str, block: Duration) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            consumer_name: format!("relay-{}", uuid::Uuid::new_v4()),
            block,
            batch_size: 100,
        })
    }
}

#[async_trait]
impl BrokerConnector for RedisStreamsConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Box::new(RedisStreamsChannel {
            conn,
            consumer_name: self.consumer_name.clone(),
            block_ms: self.block.as_millis() as usize,
            batch_size: self.batch_size,
        }))
    }
}

#[derive(Clone)]
struct RedisStreamsChannel {
    conn: MultiplexedConnection,
    consumer_name: String,
    block_ms: usize,
    batch_size: usize,
}

fn command_error(e: redis::RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        BrokerError::Connection(e.to_string())
    } else {
        BrokerError::Command(e.to_string())
    }
}

#[async_trait]
impl BrokerChannel for RedisStreamsChannel {
    fn clone_channel(&self) -> Box<dyn BrokerChannel> {
        Box::new(self.clone())
    }

    async fn declare_exchange(&mut self, _exchange: &str) -> Result<(), BrokerError> {
        // Streams are created on first write
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn bind_queue(&mut self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(exchange)
            .arg(queue)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut self.conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_error(e)),
        }
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        redis::cmd("XADD")
            .arg(exchange)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("routing_key")
            .arg(routing_key)
            .arg("body")
            .arg(body)
            .query_async::<_, String>(&mut self.conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn next_deliveries(
        &mut self,
        exchange: &str,
        queue: &str,
    ) -> Result<Vec<BrokerEnvelope>, BrokerError> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(queue)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(self.batch_size)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("NOACK")
            .arg("STREAMS")
            .arg(exchange)
            .arg(">")
            .query_async(&mut self.conn)
            .await
            .map_err(command_error)?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut deliveries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let routing_key = entry.get::<String>("routing_key");
                let body = entry.get::<Vec<u8>>("body");
                match (routing_key, body) {
                    (Some(routing_key), Some(body)) => {
                        deliveries.push(BrokerEnvelope { routing_key, body })
                    }
                    _ => warn!(entry_id = %entry.id, stream = %key.key, "skipping malformed stream entry"),
                }
            }
        }

        Ok(deliveries)
    }
}
