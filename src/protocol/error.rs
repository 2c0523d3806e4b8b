/// A frame that could not be turned into a `ServerEvent`. Always non-fatal:
/// the frame is dropped and the session continues.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not JSON.
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Frame has no string `type` discriminator.
    #[error("Frame has no event type")]
    MissingType,

    /// Known event type whose payload is missing required fields.
    #[error("Malformed {event_type} event: {reason}")]
    Malformed { event_type: String, reason: String },
}
