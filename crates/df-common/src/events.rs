use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event bus shared between the core and its external collaborators
pub struct EventBus {
    /// Configuration change notifications (admin surface / SIGHUP -> reload controller)
    pub config_changed: broadcast::Sender<ConfigChangeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            config_changed: broadcast::channel(16).0,
        }
    }

    /// Announce that a new policy has been persisted and must be applied
    pub fn policy_updated(&self) {
        if self.config_changed.send(ConfigChangeEvent::Policy).is_err() {
            tracing::debug!("Policy update published with no reload controller subscribed");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChangeEvent {
    /// Policy file and/or manual entries changed on disk
    Policy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_policy_updated_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.config_changed.subscribe();
        bus.policy_updated();
        assert_eq!(rx.recv().await.unwrap(), ConfigChangeEvent::Policy);
    }

    #[test]
    fn test_policy_updated_without_subscriber() {
        let bus = EventBus::default();
        bus.policy_updated();
    }
}
