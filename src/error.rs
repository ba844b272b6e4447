use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("cannot serialize value: {0}")]
    Serialize(String),

    #[error("backend error on '{label}': {message}")]
    Backend { label: String, message: String },

    #[error("write to closed stream '{0}'")]
    WriteToClosed(String),

    #[error("processor failed in task '{task}': {message}")]
    Processor { task: String, message: String },

    #[error("duplicate edge: {producer}({stream}) => {consumer}")]
    DuplicateEdge {
        producer: String,
        stream: String,
        consumer: String,
    },

    #[error("dependency cycle detected while walking from '{0}'")]
    CycleDetected(String),

    #[error("task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
