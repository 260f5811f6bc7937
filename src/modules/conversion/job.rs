use serde::Deserialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

const PAYLOAD_SAMPLE_LEN: usize = 500;

/// Wire shape of a conversion request. Older publishers send `uuid` and
/// `file_path`, so those names are accepted too.
#[derive(Debug, Deserialize, Validate)]
struct ConvertMessage {
    #[serde(alias = "uuid")]
    #[validate(length(min = 1))]
    job_id: String,
    #[serde(alias = "file_path")]
    #[validate(length(min = 1))]
    source_path: String,
    #[validate(length(min = 1))]
    destination_path: Option<String>,
    #[validate(length(min = 1))]
    file_name: Option<String>,
    #[serde(alias = "target_format")]
    #[validate(length(min = 1))]
    format: String,
}

/// A decoded, immutable conversion job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_id: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    /// Requested format as sent. Resolved to a [`TargetFormat`] by the transcoder.
    pub target_format: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8")]
    NotUtf8 { payload_sample: String },

    #[error("Payload does not match the job schema: {error}")]
    Schema {
        #[source]
        error: serde_json::Error,
        payload_sample: String,
    },

    #[error("Payload failed validation: {error}")]
    Invalid {
        #[source]
        error: ValidationErrors,
        payload_sample: String,
    },

    #[error("Payload has neither destination_path nor file_name")]
    MissingDestination { payload_sample: String },

    #[error("file_name '{file_name}' is not a plain file name")]
    UnsafeFileName {
        file_name: String,
        payload_sample: String,
    },
}

impl DecodeError {
    pub fn payload_sample(&self) -> &str {
        match self {
            DecodeError::NotUtf8 { payload_sample }
            | DecodeError::Schema { payload_sample, .. }
            | DecodeError::Invalid { payload_sample, .. }
            | DecodeError::MissingDestination { payload_sample }
            | DecodeError::UnsafeFileName { payload_sample, .. } => payload_sample,
        }
    }
}

fn sample(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .chars()
        .take(PAYLOAD_SAMPLE_LEN)
        .collect()
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

impl JobDescriptor {
    /// Parses an untrusted queue payload. `output_dir` anchors `file_name`
    /// when the message does not carry an explicit `destination_path`.
    pub fn decode(payload: &[u8], output_dir: &Path) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8 {
            payload_sample: sample(payload),
        })?;

        let message: ConvertMessage =
            serde_json::from_str(text).map_err(|error| DecodeError::Schema {
                error,
                payload_sample: sample(payload),
            })?;

        message.validate().map_err(|error| DecodeError::Invalid {
            error,
            payload_sample: sample(payload),
        })?;

        let destination_path = match (message.destination_path, message.file_name) {
            (Some(destination), _) => PathBuf::from(destination),
            (None, Some(file_name)) => {
                if !is_plain_file_name(&file_name) {
                    return Err(DecodeError::UnsafeFileName {
                        file_name,
                        payload_sample: sample(payload),
                    });
                }
                output_dir.join(file_name)
            }
            (None, None) => {
                return Err(DecodeError::MissingDestination {
                    payload_sample: sample(payload),
                });
            }
        };

        Ok(Self {
            job_id: message.job_id,
            source_path: PathBuf::from(message.source_path),
            destination_path,
            target_format: message.format,
        })
    }
}

/// Output containers the worker can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Mp4,
    Webm,
    Avi,
    Mpeg,
    Wmv,
}

/// Encoder names handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecPair {
    pub video: &'static str,
    pub audio: &'static str,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 5] = [
        TargetFormat::Mp4,
        TargetFormat::Webm,
        TargetFormat::Avi,
        TargetFormat::Mpeg,
        TargetFormat::Wmv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "mp4",
            TargetFormat::Webm => "webm",
            TargetFormat::Avi => "avi",
            TargetFormat::Mpeg => "mpeg",
            TargetFormat::Wmv => "wmv",
        }
    }

    pub fn codecs(&self) -> CodecPair {
        match self {
            TargetFormat::Mp4 => CodecPair { video: "libx264", audio: "aac" },
            TargetFormat::Webm => CodecPair { video: "libvpx", audio: "libvorbis" },
            TargetFormat::Avi => CodecPair { video: "libxvid", audio: "libmp3lame" },
            TargetFormat::Mpeg => CodecPair { video: "mpeg4", audio: "libmp3lame" },
            TargetFormat::Wmv => CodecPair { video: "wmv2", audio: "wmav2" },
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unsupported output format '{0}'")]
pub struct UnsupportedFormat(pub String);

impl FromStr for TargetFormat {
    type Err = UnsupportedFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == s)
            .ok_or_else(|| UnsupportedFormat(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out() -> &'static Path {
        Path::new("/data/out")
    }

    #[test]
    fn decodes_file_name_into_output_dir() {
        let payload = br#"{"job_id":"J1","source_path":"/in/a.mov","file_name":"a.mp4","format":"mp4"}"#;
        let job = JobDescriptor::decode(payload, out()).unwrap();

        assert_eq!(job.job_id, "J1");
        assert_eq!(job.source_path, PathBuf::from("/in/a.mov"));
        assert_eq!(job.destination_path, PathBuf::from("/data/out/a.mp4"));
        assert_eq!(job.target_format, "mp4");
    }

    #[test]
    fn explicit_destination_wins_over_file_name() {
        let payload = br#"{"job_id":"J1","source_path":"/in/a.mov","destination_path":"/elsewhere/b.webm","file_name":"a.mp4","format":"webm"}"#;
        let job = JobDescriptor::decode(payload, out()).unwrap();

        assert_eq!(job.destination_path, PathBuf::from("/elsewhere/b.webm"));
    }

    #[test]
    fn accepts_legacy_field_names() {
        let payload = br#"{"uuid":"abc-123","file_path":"/in/v.mp4","file_name":"v.avi","format":"avi"}"#;
        let job = JobDescriptor::decode(payload, out()).unwrap();

        assert_eq!(job.job_id, "abc-123");
        assert_eq!(job.source_path, PathBuf::from("/in/v.mp4"));
    }

    #[test]
    fn unknown_format_still_decodes() {
        let payload = br#"{"job_id":"J2","source_path":"/in/a.mov","file_name":"a.mkv","format":"mkv"}"#;
        let job = JobDescriptor::decode(payload, out()).unwrap();

        assert_eq!(job.target_format, "mkv");
    }

    #[test]
    fn missing_job_id_is_a_schema_error() {
        let payload = br#"{"source_path":"/in/a.mov","file_name":"a.mp4","format":"mp4"}"#;

        match JobDescriptor::decode(payload, out()) {
            Err(DecodeError::Schema { error, .. }) => {
                assert!(error.to_string().contains("job_id"), "unexpected error: {error}");
            }
            other => panic!("Expected Schema error, got {:?}", other),
        }
    }

    #[test]
    fn wrong_field_type_is_a_schema_error() {
        let payload = br#"{"job_id":42,"source_path":"/in/a.mov","file_name":"a.mp4","format":"mp4"}"#;
        assert!(matches!(
            JobDescriptor::decode(payload, out()),
            Err(DecodeError::Schema { .. })
        ));
    }

    #[test]
    fn python_literal_is_rejected() {
        let payload = b"{'uuid': 'J1', 'file_path': '/in/a.mov', 'file_name': 'a.mp4', 'format': 'mp4'}";
        assert!(matches!(
            JobDescriptor::decode(payload, out()),
            Err(DecodeError::Schema { .. })
        ));
    }

    #[test]
    fn empty_job_id_fails_validation() {
        let payload = br#"{"job_id":"","source_path":"/in/a.mov","file_name":"a.mp4","format":"mp4"}"#;
        assert!(matches!(
            JobDescriptor::decode(payload, out()),
            Err(DecodeError::Invalid { .. })
        ));
    }

    #[test]
    fn missing_destination_is_rejected() {
        let payload = br#"{"job_id":"J1","source_path":"/in/a.mov","format":"mp4"}"#;
        assert!(matches!(
            JobDescriptor::decode(payload, out()),
            Err(DecodeError::MissingDestination { .. })
        ));
    }

    #[test]
    fn file_name_cannot_escape_output_dir() {
        for name in ["../etc/passwd", "/abs.mp4", "nested/a.mp4", "..", "."] {
            let payload = serde_json::json!({
                "job_id": "J1",
                "source_path": "/in/a.mov",
                "file_name": name,
                "format": "mp4",
            })
            .to_string();

            match JobDescriptor::decode(payload.as_bytes(), out()) {
                Err(DecodeError::UnsafeFileName { file_name, .. }) => assert_eq!(file_name, name),
                other => panic!("Expected UnsafeFileName for {name:?}, got {:?}", other),
            }
        }
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let payload = [0xff, 0xfe, 0x00];
        assert!(matches!(
            JobDescriptor::decode(&payload, out()),
            Err(DecodeError::NotUtf8 { .. })
        ));
    }

    #[test]
    fn payload_sample_is_bounded() {
        let payload = "x".repeat(2_000);
        let err = JobDescriptor::decode(payload.as_bytes(), out()).unwrap_err();

        assert_eq!(err.payload_sample().len(), PAYLOAD_SAMPLE_LEN);
    }

    #[test]
    fn every_format_has_a_codec_pair() {
        assert_eq!(
            "mp4".parse::<TargetFormat>().unwrap().codecs(),
            CodecPair { video: "libx264", audio: "aac" }
        );
        assert_eq!(
            "webm".parse::<TargetFormat>().unwrap().codecs(),
            CodecPair { video: "libvpx", audio: "libvorbis" }
        );
        assert_eq!(
            "wmv".parse::<TargetFormat>().unwrap().codecs(),
            CodecPair { video: "wmv2", audio: "wmav2" }
        );
        for format in TargetFormat::ALL {
            assert_eq!(format.as_str().parse::<TargetFormat>(), Ok(format));
        }
    }

    #[test]
    fn unsupported_format_is_rejected() {
        assert_eq!(
            "mkv".parse::<TargetFormat>(),
            Err(UnsupportedFormat("mkv".to_string()))
        );
        assert!("MP4".parse::<TargetFormat>().is_err());
    }
}
