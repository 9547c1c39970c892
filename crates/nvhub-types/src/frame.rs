//! Control-plane framing: a 4-byte big-endian length followed by a JSON envelope.

use crate::ControlEnvelope;
use std::io::{self, Read, Write};

/// Upper bound on a single frame body. A launch request carries the caller's
/// environment, so this is generous, but it keeps a garbage prefix from
/// triggering a huge allocation.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed before a frame was sent")]
    Empty,
    #[error("frame i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("frame length {0} exceeds limit of {MAX_FRAME_LEN} bytes")]
    TooLarge(usize),
    #[error("frame body is not a valid control envelope: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_frame(envelope: &ControlEnvelope) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn write_frame<W: Write>(writer: &mut W, envelope: &ControlEnvelope) -> Result<(), FrameError> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<ControlEnvelope, FrameError> {
    let mut prefix = [0_u8; 4];
    let first = loop {
        match reader.read(&mut prefix[..1]) {
            Ok(read) => break read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    };
    if first == 0 {
        return Err(FrameError::Empty);
    }
    reader.read_exact(&mut prefix[1..])?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CliErrorReport, ControlMessage, LaunchRequest};
    use std::collections::BTreeMap;
    use std::io::Cursor;

    fn decode(bytes: Vec<u8>) -> Result<ControlEnvelope, FrameError> {
        read_frame(&mut Cursor::new(bytes))
    }

    #[test]
    fn length_prefix_is_big_endian_body_size() {
        let envelope = ControlEnvelope::run(LaunchRequest::new("/tmp", "nvim"));
        let frame = encode_frame(&envelope).unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4);
    }

    #[test]
    fn launch_request_survives_framing_with_unicode_and_empty_fields() {
        let mut request = LaunchRequest::new("/home/ü/проект", "/opt/neovide/bin/neovide");
        request.explicit_name = Some("日本語 project".to_string());
        request.path_argument = Some("src/main.rs".to_string());
        request.extra_args = vec![String::new(), "--".to_string(), "-c".to_string()];

        let frame = encode_frame(&ControlEnvelope::run(request.clone())).unwrap();
        let decoded = decode(frame).unwrap().into_message().unwrap();
        assert_eq!(decoded, ControlMessage::Run(request));
    }

    #[test]
    fn launch_request_with_environment_survives_framing() {
        let mut request = LaunchRequest::new("/srv/app", "nvim");
        request.environment = BTreeMap::from([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("EMPTY".to_string(), String::new()),
        ]);
        let frame = encode_frame(&ControlEnvelope::run(request.clone())).unwrap();
        assert_eq!(
            decode(frame).unwrap().into_message().unwrap(),
            ControlMessage::Run(request)
        );
    }

    #[test]
    fn cli_error_survives_framing() {
        let report = CliErrorReport {
            message: "editor binary not found".to_string(),
            details: BTreeMap::from([("binary".to_string(), "neovide".to_string())]),
        };
        let frame = encode_frame(&ControlEnvelope::cli_error(report.clone())).unwrap();
        assert_eq!(
            decode(frame).unwrap().into_message().unwrap(),
            ControlMessage::CliError(report)
        );
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_reading_body() {
        let mut bytes = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        assert!(matches!(decode(bytes), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn truncated_body_is_an_io_error() {
        let mut bytes = 64_u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(br#"{"type":"run""#);
        assert!(matches!(decode(bytes), Err(FrameError::Io(_))));
    }

    #[test]
    fn empty_stream_is_distinguished_from_truncation() {
        assert!(matches!(decode(Vec::new()), Err(FrameError::Empty)));
        assert!(matches!(decode(vec![0, 0]), Err(FrameError::Io(_))));
    }

    #[test]
    fn invalid_json_body_is_a_json_error() {
        let body = b"not json";
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        assert!(matches!(decode(bytes), Err(FrameError::Json(_))));
    }
}
