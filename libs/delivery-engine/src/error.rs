use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// Topology re-declaration hit `PRECONDITION_FAILED`: the running
    /// deployment's topology disagrees with what this process expects.
    /// Fatal by design -- silently re-declaring would mask an operator
    /// error (a queue argument changed out from under a live deployment).
    #[error("topology precondition mismatch, refusing to continue: {0}")]
    TopologyMismatch(String),

    #[error("consumer stream ended unexpectedly")]
    StreamEnded,
}
