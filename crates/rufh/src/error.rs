use salvo_core::http::StatusCode;

pub type RufhResult<T> = Result<T, RufhError>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("malformed structured field: {0}")]
    Malformed(&'static str),
    #[error("Upload-Length conflicts with the length already on record")]
    LengthConflict,
    #[error("request body exceeds the declared Upload-Length")]
    LengthExceeded,
    #[error("request completed before reaching the declared Upload-Length")]
    ShortBody,
    #[error("Upload-Draft-Interop-Version does not match the version the upload was opened with")]
    InteropMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum RufhError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("upload not found")]
    NotFound,

    #[error("offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("another transaction is already sending to this upload")]
    ProducerBusy,

    #[error("an upload with this token already exists")]
    AlreadyExists,

    #[error("upload is already complete")]
    Concluded,

    #[error("upload terminated")]
    Terminated,
}

impl RufhError {
    pub fn status(&self) -> StatusCode {
        match self {
            RufhError::Protocol(ProtocolError::InteropMismatch) => StatusCode::PRECONDITION_FAILED, // 412
            RufhError::Protocol(_) => StatusCode::BAD_REQUEST, // 400

            RufhError::NotFound => StatusCode::NOT_FOUND, // 404
            RufhError::OffsetMismatch { .. } => StatusCode::CONFLICT, // 409
            RufhError::ProducerBusy => StatusCode::CONFLICT, // 409
            RufhError::AlreadyExists => StatusCode::CONFLICT, // 409
            RufhError::Concluded => StatusCode::CONFLICT,  // 409
            RufhError::Terminated => StatusCode::GONE,     // 410
        }
    }
}
