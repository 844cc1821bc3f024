//! Inner business message, structured only as far as routing needs it.

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

/// Origin description of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub message_id: String,
    /// Unix epoch milliseconds.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// Content segment. `data` is opaque to the bus; handlers interpret it by
/// `seg_type` (wire name `type`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSegment {
    #[serde(rename = "type")]
    pub seg_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Routing target: the RECEIVER's identity, never the sender's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDim {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub platform: String,
}

/// Business payload carried by `Standard` envelopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub message_info: MessageInfo,
    pub message_segment: MessageSegment,
    #[serde(default)]
    pub message_dim: MessageDim,
}

impl Payload {
    /// Validate the routing target. Both `message_dim` fields must be
    /// non-empty for the message to be routable; absence is a validation
    /// error, not a silent drop.
    pub fn check_routable(&self) -> Result<()> {
        if self.message_dim.api_key.is_empty() {
            return Err(BusError::RouteUnresolved(
                "message_dim.api_key is empty".into(),
            ));
        }
        if self.message_dim.platform.is_empty() {
            return Err(BusError::RouteUnresolved(
                "message_dim.platform is empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn dim(api_key: &str, platform: &str) -> Payload {
        Payload {
            message_dim: MessageDim {
                api_key: api_key.into(),
                platform: platform.into(),
            },
            ..Payload::default()
        }
    }

    #[test]
    fn routable_requires_both_dim_fields() {
        assert!(dim("k1", "qq").check_routable().is_ok());
        assert!(matches!(
            dim("", "qq").check_routable(),
            Err(BusError::RouteUnresolved(_))
        ));
        assert!(matches!(
            dim("k1", "").check_routable(),
            Err(BusError::RouteUnresolved(_))
        ));
    }
}
