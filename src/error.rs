use thiserror::Error;

/// Failures of the broker session.
///
/// `Connection` is the only variant that changes control flow: the supervisor
/// backs off and retries. Everything else drops the affected message.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to broker: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("not connected to broker")]
    NotConnected,

    #[error("could not publish to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    #[error("could not encode discovery payload: {0}")]
    Encode(#[from] serde_json::Error),
}
