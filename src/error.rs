use thiserror::Error;

pub use aws_error::AwsError;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("timestamp regex specified without timestamp format")]
    IncompleteTimestampRule,

    #[error("no timestamp found in line")]
    MissingTimestamp,

    #[error("invalid timestamp: {0}")]
    TimestampParse(#[from] chrono::ParseError),

    #[error("event is missing required field \"{0}\"")]
    MissingField(&'static str),

    #[error("event carries no routing key (fields.s3.appType, fields.appType or source)")]
    MissingRouting,

    #[error("channel closed")]
    Channel,

    #[error("output is closing")]
    Closing,

    #[error("no output registered under \"{0}\"")]
    UnknownOutput(String),

    #[error("upload abandoned during shutdown")]
    UploadAbandoned,

    #[error("aws error: {0}")]
    Aws(#[from] AwsError),
}

impl Error {
    pub fn channel() -> Self {
        Self::Channel
    }

    pub fn invalid_settings(msg: impl ToString) -> Self {
        Self::InvalidSettings(msg.to_string())
    }
}

mod aws_error {
    use super::Error;

    use aws_sdk_s3::{
        error::SdkError, operation::put_object::PutObjectError, primitives::ByteStreamError,
    };

    #[derive(thiserror::Error, Debug)]
    pub enum AwsError {
        #[error("put_object: {0}")]
        PutObject(PutObjectError),

        #[error("put_object_byte_stream: {0}")]
        ByteStream(ByteStreamError),
    }

    impl AwsError {
        pub fn put_object_error(err: SdkError<PutObjectError>) -> Error {
            Error::Aws(Self::PutObject(err.into_service_error()))
        }

        pub fn byte_stream_error(err: ByteStreamError) -> Error {
            Error::Aws(Self::ByteStream(err))
        }
    }
}
