// Queue addressing: `wharf://<domain>/<queue>[?id=<appId>]`.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

const SCHEME: &str = "wharf://";

/// App id used by priority and broadcast queues, which have a single branch.
pub const DEFAULT_APP_ID: &str = "__default";

/// Queue identity without the app id; one per stored queue.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct QueueKey {
    pub domain: String,
    pub queue: String,
}

impl QueueKey {
    pub fn new(domain: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            queue: queue.into(),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}/{}", self.domain, self.queue)
    }
}

/// Parsed queue URI as clients address it.
///
/// ```
/// use wharf_common::QueueUri;
///
/// let uri: QueueUri = "wharf://orders/eu?id=audit".parse().expect("uri");
/// assert_eq!(uri.domain(), "orders");
/// assert_eq!(uri.queue(), "eu");
/// assert_eq!(uri.app_id(), Some("audit"));
/// ```
#[derive(Debug, Clone, Hash, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct QueueUri {
    key: QueueKey,
    app_id: Option<String>,
}

impl QueueUri {
    pub fn new(domain: impl Into<String>, queue: impl Into<String>) -> Result<Self> {
        let key = QueueKey::new(domain, queue);
        validate_segment(&key.domain)?;
        validate_segment(&key.queue)?;
        Ok(Self { key, app_id: None })
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Result<Self> {
        let app_id = app_id.into();
        validate_segment(&app_id)?;
        self.app_id = Some(app_id);
        Ok(self)
    }

    pub fn domain(&self) -> &str {
        &self.key.domain
    }

    pub fn queue(&self) -> &str {
        &self.key.queue
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    /// App id naming the branch this URI consumes from.
    pub fn branch(&self) -> &str {
        self.app_id.as_deref().unwrap_or(DEFAULT_APP_ID)
    }
}

impl fmt::Display for QueueUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if let Some(app_id) = &self.app_id {
            write!(f, "?id={app_id}")?;
        }
        Ok(())
    }
}

impl FromStr for QueueUri {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidUri(input.into()))?;
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        let (domain, queue) = path
            .split_once('/')
            .ok_or_else(|| Error::InvalidUri(input.into()))?;
        let uri = QueueUri::new(domain, queue).map_err(|_| Error::InvalidUri(input.into()))?;
        match query {
            None => Ok(uri),
            Some(query) => {
                let app_id = query
                    .strip_prefix("id=")
                    .ok_or_else(|| Error::InvalidUri(input.into()))?;
                uri.with_app_id(app_id)
                    .map_err(|_| Error::InvalidUri(input.into()))
            }
        }
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidUri(segment.into()))
    }
}

/// Which fanout branches an admin purge applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppSelector {
    All,
    App(String),
}

impl AppSelector {
    pub fn matches(&self, app_id: &str) -> bool {
        match self {
            AppSelector::All => true,
            AppSelector::App(selected) => selected == app_id,
        }
    }
}

impl FromStr for AppSelector {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "" => Err(Error::InvalidSelector(input.into())),
            "*" => Ok(AppSelector::All),
            app_id => Ok(AppSelector::App(app_id.to_string())),
        }
    }
}

impl fmt::Display for AppSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppSelector::All => f.write_str("*"),
            AppSelector::App(app_id) => f.write_str(app_id),
        }
    }
}
