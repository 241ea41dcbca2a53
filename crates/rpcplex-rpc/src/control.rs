use serde::{Deserialize, Serialize};

/// CONTROL message type: the sender is closing the channel.
pub const CONTROL_GOODBYE: &str = "goodbye";

/// CONTROL channel message payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ControlMessage {
    /// Create a goodbye message.
    pub fn goodbye(reason: Option<&str>) -> Self {
        let payload = reason.map(|reason| serde_json::json!({ "reason": reason }));
        Self {
            msg_type: CONTROL_GOODBYE.to_string(),
            payload,
        }
    }

    pub fn is_goodbye(&self) -> bool {
        self.msg_type == CONTROL_GOODBYE
    }

    /// Reason attached to a goodbye, if any.
    pub fn reason(&self) -> Option<&str> {
        self.payload.as_ref()?.get("reason")?.as_str()
    }
}
