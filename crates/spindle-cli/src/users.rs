//! User registration stream consumer.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use spindle_core::HandlerError;
use spindle_core::app::StreamHandler;
use spindle_core::domain::StreamEntry;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub email: String,
}

/// Simulates a flaky registration: about 60% of deliveries fail until the
/// last try, which always succeeds so nothing is re-appended forever.
pub struct UserCreationConsumer;

#[async_trait]
impl StreamHandler for UserCreationConsumer {
    async fn handle(&self, entry: StreamEntry, consumer_id: &str) -> Result<(), HandlerError> {
        let user: User = match serde_json::from_str(&entry.value) {
            Ok(user) => user,
            Err(e) => {
                // 再試行しても直らないので落とす
                warn!(error = %e, value = %entry.value, "invalid user entry dropped");
                return Ok(());
            }
        };

        let roll: f32 = rand::thread_rng().gen_range(0.0..1.0);
        if roll >= 0.4 {
            if !entry.is_last_try() {
                return Err(HandlerError::new(format!(
                    "failed to process, random number '{roll}'"
                )));
            }
            warn!(
                entry_id = %entry.id,
                retries = entry.retries,
                last_error = %entry.last_error,
                "giving up on user entry"
            );
            return Ok(());
        }

        info!(
            user = %user.name,
            email = %user.email,
            retries = entry.retries,
            consumer_id,
            "user processed"
        );
        Ok(())
    }
}
