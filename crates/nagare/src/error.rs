use thiserror::Error;

#[derive(Error, Debug)]
pub enum NagareError {
    #[error("multiple periods not supported")]
    MultiplePeriods,

    #[error("no period found")]
    NoPeriod,

    #[error("no {0} representation found")]
    NoRepresentation(&'static str),

    #[error("missing representation mime type")]
    MissingMimeType,

    #[error("missing representation id")]
    MissingRepresentationId,

    #[error("missing segment template")]
    MissingSegmentTemplate,

    #[error("missing segment template field: {0}")]
    MissingTemplateField(&'static str),

    #[error("failed to open first segment: {0}")]
    FirstSegmentMissing(String),

    #[error("box is too small")]
    BoxTooSmall,

    #[error("truncated box")]
    TruncatedBox,

    #[error("multiple mdhd boxes")]
    MultipleMdhd,

    #[error("missing timescale")]
    MissingTimescale,

    #[error("atom size is too small")]
    AtomTooSmall,

    #[error("atom size is too large")]
    AtomTooLarge,

    #[error("only warp atoms are supported")]
    UnknownAtom,

    #[error("stream buffer limit exceeded")]
    StreamOverflow,

    #[error("stream is closed")]
    StreamClosed,

    #[error("shaper command failed: {0}")]
    ShaperCommand(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),
}

pub type NagareResult<T> = Result<T, NagareError>;
