use serde_json::{Value, json};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Message is missing executionId")]
    MissingExecutionId,

    #[error("<{0}> message is missing parent")]
    MissingParent(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Unknown service {0}")]
    UnknownService(String),

    #[error("<{id}> invalid loop cardinality >{value}<")]
    InvalidLoopCardinality { id: String, value: String },

    #[error("<{id}> invalid loop collection >{value}<")]
    InvalidCollection { id: String, value: String },

    #[error("<{0}> parallel loop requires a cardinality or a collection")]
    UnboundedParallelLoop(String),

    #[error("Invalid duration >{0}<")]
    InvalidDuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    // Short name used when an error travels inside an execute.error message
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MissingExecutionId | Error::MissingParent(_) => "InvalidMessage",
            Error::Expression(_) | Error::UnknownService(_) => "ExpressionError",
            Error::InvalidLoopCardinality { .. } | Error::InvalidCollection { .. } => "RunError",
            Error::UnboundedParallelLoop(_) | Error::InvalidDuration(_) => "RunError",
            Error::Serialization(_) => "SerializationError",
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "type": self.kind(),
            "message": self.to_string(),
        })
    }
}
