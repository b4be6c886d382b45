// Message payloads, typed properties and confirmation selectors.
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ids::MessageGuid;
use crate::uri::QueueUri;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Bool,
    Int32,
    Int64,
    String,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Binary(Bytes),
}

impl PropertyValue {
    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::Int32(_) => PropertyType::Int32,
            PropertyValue::Int64(_) => PropertyType::Int64,
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Binary(_) => PropertyType::Binary,
        }
    }
}

/// Named, typed message properties.
///
/// ```
/// use wharf_common::{MessageProperties, PropertyType, PropertyValue};
///
/// let mut props = MessageProperties::new();
/// props.set("retries", PropertyValue::Int32(3));
/// props.set("region", PropertyValue::String("eu".into()));
/// assert_eq!(props.len(), 2);
/// assert_eq!(props.property_type("retries"), Some(PropertyType::Int32));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    entries: BTreeMap<String, PropertyValue>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    // Returns the previous value when a property is overwritten.
    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) -> Option<PropertyValue> {
        self.entries.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.get(name)
    }

    pub fn property_type(&self, name: &str) -> Option<PropertyType> {
        self.entries.get(name).map(PropertyValue::property_type)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// A posted message. The GUID is assigned by the posting side and survives
/// re-sends after failover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub guid: MessageGuid,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

impl Message {
    pub fn new(payload: Bytes) -> Self {
        Self {
            guid: MessageGuid::new(),
            payload,
            properties: MessageProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    // Flow control accounts for payload bytes only.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// A message pushed to a consumer handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub uri: QueueUri,
    pub guid: MessageGuid,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

/// Which unconfirmed messages a CONFIRM applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmSelector {
    Guid(MessageGuid),
    All,
    // Oldest N unconfirmed messages in delivery order.
    Oldest(usize),
}

impl FromStr for ConfirmSelector {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        if input == "*" {
            return Ok(ConfirmSelector::All);
        }
        if let Some(count) = input.strip_prefix('+') {
            let count = count
                .parse::<usize>()
                .map_err(|_| Error::InvalidSelector(input.into()))?;
            return Ok(ConfirmSelector::Oldest(count));
        }
        let guid = input
            .parse::<MessageGuid>()
            .map_err(|_| Error::InvalidSelector(input.into()))?;
        Ok(ConfirmSelector::Guid(guid))
    }
}

impl fmt::Display for ConfirmSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmSelector::Guid(guid) => write!(f, "{guid}"),
            ConfirmSelector::All => f.write_str("*"),
            ConfirmSelector::Oldest(count) => write!(f, "+{count}"),
        }
    }
}
