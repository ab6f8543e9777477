//! Session error taxonomy reported to the observer.

use thiserror::Error;

/// A session-level failure.
///
/// Negotiation errors come from OFFER/ANSWER processing; the rest are
/// routed from the transport, capture and encode collaborators. Each variant
/// carries a stable numeric code so observers can persist or forward it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SessionError {
    #[error("timed out waiting for ANSWER")]
    AnswerTimeOut,

    #[error("receiver returned a malformed or error ANSWER")]
    AnswerNotOk,

    #[error("ANSWER sendIndexes and ssrcs have different lengths")]
    AnswerMismatchedSsrcLength,

    #[error("ANSWER selected more than one audio stream")]
    AnswerSelectMultipleAudio,

    #[error("ANSWER selected more than one video stream")]
    AnswerSelectMultipleVideo,

    #[error("ANSWER selected a stream index that was not offered")]
    AnswerSelectInvalidIndex,

    #[error("ANSWER selected neither audio nor video")]
    AnswerNoAudioOrVideo,

    #[error("audio capture failed")]
    AudioCaptureError,

    #[error("video capture failed")]
    VideoCaptureError,

    #[error("RTP stream error")]
    RtpStreamError,

    #[error("encoder failed")]
    EncodingError,

    #[error("cast transport failed")]
    CastTransportError,

    /// No stream could be offered for the requested session type.
    #[error("no audio or video stream could be offered")]
    OfferConfigurationError,
}

impl SessionError {
    /// Stable numeric code for this error.
    pub fn code(self) -> u32 {
        match self {
            Self::AnswerTimeOut => 1,
            Self::AnswerNotOk => 2,
            Self::AnswerMismatchedSsrcLength => 3,
            Self::AnswerSelectMultipleAudio => 4,
            Self::AnswerSelectMultipleVideo => 5,
            Self::AnswerSelectInvalidIndex => 6,
            Self::AnswerNoAudioOrVideo => 7,
            Self::AudioCaptureError => 8,
            Self::VideoCaptureError => 9,
            Self::RtpStreamError => 10,
            Self::EncodingError => 11,
            Self::CastTransportError => 12,
            Self::OfferConfigurationError => 13,
        }
    }

    /// Whether this error came out of OFFER/ANSWER negotiation.
    pub fn is_negotiation_error(self) -> bool {
        matches!(
            self,
            Self::AnswerTimeOut
                | Self::AnswerNotOk
                | Self::AnswerMismatchedSsrcLength
                | Self::AnswerSelectMultipleAudio
                | Self::AnswerSelectMultipleVideo
                | Self::AnswerSelectInvalidIndex
                | Self::AnswerNoAudioOrVideo
        )
    }
}

/// Failure to interpret an inbound cast message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no \"type\" field")]
    MissingType,

    #[error("message has no integer \"seqNum\" field")]
    MissingSequenceNumber,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let all = [
            SessionError::AnswerTimeOut,
            SessionError::AnswerNotOk,
            SessionError::AnswerMismatchedSsrcLength,
            SessionError::AnswerSelectMultipleAudio,
            SessionError::AnswerSelectMultipleVideo,
            SessionError::AnswerSelectInvalidIndex,
            SessionError::AnswerNoAudioOrVideo,
            SessionError::AudioCaptureError,
            SessionError::VideoCaptureError,
            SessionError::RtpStreamError,
            SessionError::EncodingError,
            SessionError::CastTransportError,
            SessionError::OfferConfigurationError,
        ];
        let mut codes: Vec<u32> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_negotiation_classification() {
        assert!(SessionError::AnswerTimeOut.is_negotiation_error());
        assert!(SessionError::AnswerNoAudioOrVideo.is_negotiation_error());
        assert!(!SessionError::CastTransportError.is_negotiation_error());
        assert!(!SessionError::EncodingError.is_negotiation_error());
    }
}
