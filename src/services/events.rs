use redis::AsyncCommands;
use serde::Serialize;

/// Channel a partial result is published on:
/// `{owner_id}.{entity}.{entity_id}.{event}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventChannel {
    pub owner_id: i64,
    pub entity: &'static str,
    pub entity_id: i64,
    pub event: &'static str,
}

impl EventChannel {
    pub fn frame_side(owner_id: i64, frame_side_id: i64, event: &'static str) -> Self {
        Self {
            owner_id,
            entity: "frame_side",
            entity_id: frame_side_id,
            event,
        }
    }

    pub fn hive_box(owner_id: i64, box_id: i64, event: &'static str) -> Self {
        Self {
            owner_id,
            entity: "box",
            entity_id: box_id,
            event,
        }
    }

    pub fn name(&self) -> String {
        format!("{}.{}.{}.{}", self.owner_id, self.entity, self.entity_id, self.event)
    }
}

/// Redis pub/sub publisher for partial detection results.
pub struct EventPublisher {
    client: redis::Client,
}

impl EventPublisher {
    pub fn new(redis_url: &str) -> Result<Self, EventError> {
        let client = redis::Client::open(redis_url).map_err(EventError::Redis)?;
        Ok(Self { client })
    }

    pub async fn publish<T: Serialize>(&self, channel: &EventChannel, body: &T) -> Result<(), EventError> {
        let payload = serde_json::to_string(body).map_err(EventError::Serialize)?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(EventError::Redis)?;
        conn.publish::<_, _, ()>(channel.name(), payload)
            .await
            .map_err(EventError::Redis)?;
        Ok(())
    }

    /// Publish and log instead of failing; events never fail a job.
    pub async fn publish_logged<T: Serialize>(&self, channel: &EventChannel, body: &T) {
        if let Err(e) = self.publish(channel, body).await {
            tracing::warn!(channel = %channel.name(), error = %e, "Failed to publish event");
        }
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), EventError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(EventError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(EventError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
