use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Error produced by a job type's payload codec.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CodecError(String);

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(value: serde_json::Error) -> Self {
        Self(value.to_string())
    }
}

/// Error returned from a job handler. Any error type works; it is captured
/// as text if the job ends up permanently failed.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A named, typed unit of background work.
///
/// Implementors define the payload type, the handler body, and optionally a
/// payload codec other than the default JSON one. The handler receives the
/// decoded payload; returning an error (or panicking) consumes one retry.
///
/// ```ignore
/// struct SendWelcomeEmail;
///
/// #[async_trait]
/// impl JobType for SendWelcomeEmail {
///     type Data = String;
///     const NAME: &'static str = "send_welcome_email";
///     const RETRIES: u32 = 3;
///
///     async fn perform(&self, address: String) -> Result<(), HandlerError> {
///         mailer::send(&address).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobType: Send + Sync + 'static {
    /// The handler's argument, produced from the persisted payload by
    /// [`JobType::decode`].
    type Data: Serialize + DeserializeOwned + Send + 'static;

    /// Unique name the job type registers under.
    const NAME: &'static str;

    /// Default retry budget for jobs of this type.
    const RETRIES: u32 = 0;

    async fn perform(&self, data: Self::Data) -> Result<(), HandlerError>;

    fn encode(data: &Self::Data) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(data).map_err(Into::into)
    }

    fn decode(payload: &[u8]) -> Result<Self::Data, CodecError> {
        serde_json::from_slice(payload).map_err(Into::into)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) struct EchoJob;

    #[async_trait]
    impl JobType for EchoJob {
        type Data = String;
        const NAME: &'static str = "echo";

        async fn perform(&self, _data: String) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn default_codec_is_json() {
        let payload = EchoJob::encode(&"hello".to_owned()).unwrap();
        assert_eq!(payload, b"\"hello\"");
        assert_eq!(EchoJob::decode(&payload).unwrap(), "hello");
    }

    #[test]
    fn decode_failure_reports_codec_error() {
        let err = EchoJob::decode(b"{not json").unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
