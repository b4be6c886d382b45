// Handle flags, consumer parameters and per-domain configuration.
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const DEFAULT_CONSUMER_PRIORITY: i32 = 1;
const DEFAULT_MAX_UNCONFIRMED_MESSAGES: u64 = 1024;
const DEFAULT_MAX_UNCONFIRMED_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleFlags {
    pub read: bool,
    pub write: bool,
    pub ack: bool,
    pub admin: bool,
}

impl HandleFlags {
    pub fn reader() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn writer() -> Self {
        Self {
            write: true,
            ack: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.read || self.write || self.admin) {
            return Err(Error::InvalidFlags(
                "at least one of read, write or admin is required".into(),
            ));
        }
        if self.ack && !self.write {
            return Err(Error::InvalidFlags("ack requires write".into()));
        }
        Ok(())
    }
}

/// Consumer-side parameters carried by Open, Configure and Reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerParams {
    pub priority: i32,
    pub max_unconfirmed_messages: u64,
    pub max_unconfirmed_bytes: u64,
}

impl Default for ConsumerParams {
    fn default() -> Self {
        Self {
            priority: DEFAULT_CONSUMER_PRIORITY,
            max_unconfirmed_messages: DEFAULT_MAX_UNCONFIRMED_MESSAGES,
            max_unconfirmed_bytes: DEFAULT_MAX_UNCONFIRMED_BYTES,
        }
    }
}

impl ConsumerParams {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_caps(mut self, max_messages: u64, max_bytes: u64) -> Self {
        self.max_unconfirmed_messages = max_messages;
        self.max_unconfirmed_bytes = max_bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.priority < 0 {
            return Err(Error::InvalidFlags(format!(
                "negative consumer priority {}",
                self.priority
            )));
        }
        Ok(())
    }

    // A consumer with no message allowance is kept open but never routed to.
    pub fn accepts_deliveries(&self) -> bool {
        self.max_unconfirmed_messages > 0 && self.max_unconfirmed_bytes > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingMode {
    Priority,
    Fanout { app_ids: Vec<String> },
    Broadcast,
}

impl RoutingMode {
    pub fn name(&self) -> &'static str {
        match self {
            RoutingMode::Priority => "priority",
            RoutingMode::Fanout { .. } => "fanout",
            RoutingMode::Broadcast => "broadcast",
        }
    }
}

/// Domain settings shared by every queue in the domain.
///
/// ```
/// use wharf_common::{DomainConfig, RoutingMode};
///
/// let config = DomainConfig::new("orders", RoutingMode::Priority).with_max_consumers(1);
/// assert_eq!(config.max_consumers, Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    #[serde(flatten)]
    pub mode: RoutingMode,
    #[serde(default)]
    pub max_consumers: Option<usize>,
    #[serde(default)]
    pub max_producers: Option<usize>,
}

impl DomainConfig {
    pub fn new(name: impl Into<String>, mode: RoutingMode) -> Self {
        Self {
            name: name.into(),
            mode,
            max_consumers: None,
            max_producers: None,
        }
    }

    pub fn with_max_consumers(mut self, max: usize) -> Self {
        self.max_consumers = Some(max);
        self
    }

    pub fn with_max_producers(mut self, max: usize) -> Self {
        self.max_producers = Some(max);
        self
    }

    /// Branches a posted message is recorded against.
    pub fn app_ids(&self) -> Vec<String> {
        match &self.mode {
            RoutingMode::Fanout { app_ids } => app_ids.clone(),
            _ => vec![crate::DEFAULT_APP_ID.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_require_a_role() {
        assert!(HandleFlags::default().validate().is_err());
        assert!(HandleFlags::reader().validate().is_ok());
        assert!(HandleFlags::writer().validate().is_ok());
        let ack_only = HandleFlags {
            read: true,
            ack: true,
            ..HandleFlags::default()
        };
        assert!(ack_only.validate().is_err());
    }

    #[test]
    fn zero_caps_disable_routing() {
        let params = ConsumerParams::default().with_caps(0, 10);
        assert!(!params.accepts_deliveries());
        assert!(ConsumerParams::default().accepts_deliveries());
        assert!(ConsumerParams::default().with_priority(-1).validate().is_err());
    }

    #[test]
    fn domain_config_parses_from_yaml() {
        let yaml = "name: fan\nmode: fanout\napp_ids: [foo, bar]\nmax_consumers: 2\n";
        let config: DomainConfig = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(
            config.mode,
            RoutingMode::Fanout {
                app_ids: vec!["foo".into(), "bar".into()]
            }
        );
        assert_eq!(config.max_consumers, Some(2));
        assert_eq!(config.max_producers, None);
        assert_eq!(config.app_ids(), vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn non_fanout_domains_use_default_branch() {
        let config = DomainConfig::new("bcast", RoutingMode::Broadcast);
        assert_eq!(config.app_ids(), vec![crate::DEFAULT_APP_ID.to_string()]);
    }
}
