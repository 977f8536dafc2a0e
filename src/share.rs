use {
    super::*,
    byteorder::{BigEndian, ByteOrder},
    snafu::Snafu,
};

const RESULT_VALUE_OFFSET: usize = 24;
const RESULT_VALUE_LENGTH: usize = 8;

/// How hard the proxy looks at a share before forwarding it. Levels are
/// cumulative; the job-slot match and duplicate-nonce check always run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationLevel {
    #[default]
    Normal,
    Format,
    /// Experimental: the target comparison has not been verified against a
    /// reference miner.
    Difficulty,
    Full,
}

impl From<u8> for ValidationLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => Self::Normal,
            1 => Self::Format,
            2 => Self::Difficulty,
            _ => Self::Full,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum ShareError {
    #[snafu(display("invalid job id"))]
    BadJobId,

    #[snafu(display("duplicate share"))]
    DuplicateShare,

    #[snafu(display("malformed share"))]
    MalformedShare,

    #[snafu(display("share difficulty too low"))]
    DiffTooLow,

    #[snafu(display("no client to handle share"))]
    NoUpstream,

    #[snafu(display("proxy unavailable"))]
    Unavailable,

    #[snafu(display("{message}"))]
    Pool { message: String },
}

/// A worker's claim that `nonce` hashes `job_id`'s blob under the target.
/// Serializes directly as upstream `submit` params; `auth_id` is stamped
/// by the proxy before forwarding.
#[derive(Debug, Clone, Serialize)]
pub struct Share {
    #[serde(rename = "id")]
    pub auth_id: String,
    pub job_id: String,
    pub nonce: String,
    pub result: String,
}

impl Share {
    /// Lenient extraction: missing members become empty strings and fail
    /// validation instead of erroring here.
    pub fn from_params(params: &Value) -> Self {
        let field = |key| {
            params
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Self {
            auth_id: String::new(),
            job_id: field("job_id"),
            nonce: field("nonce"),
            result: field("result"),
        }
    }

    /// Checks this share against the job it claims to extend. The caller
    /// has already matched `job_id` to `job`.
    pub(crate) fn validate(&self, job: &Job, level: ValidationLevel) -> Result<(), ShareError> {
        if job.seen_nonce(&self.nonce) {
            return Err(ShareError::DuplicateShare);
        }

        if level >= ValidationLevel::Format {
            self.validate_format()?;
        }

        if level >= ValidationLevel::Difficulty {
            self.validate_difficulty(job)?;
        }

        // ValidationLevel::Full would recompute the hash; not implemented

        Ok(())
    }

    fn validate_format(&self) -> Result<(), ShareError> {
        let hex_of_len = |s: &str, len| s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit());

        if !hex_of_len(&self.nonce, 2 * job::NONCE_LENGTH) || !hex_of_len(&self.result, 64) {
            return Err(ShareError::MalformedShare);
        }

        Ok(())
    }

    fn validate_difficulty(&self, job: &Job) -> Result<(), ShareError> {
        let target = match job.target_as_u64() {
            Ok(target) => target,
            Err(err) => {
                // record and let the share through so a bad target format
                // cannot strand a whole job
                warn!("error validating difficulty: {err}");
                return Ok(());
            }
        };

        if self.result_as_u64()? < target {
            return Err(ShareError::DiffTooLow);
        }

        Ok(())
    }

    fn result_as_u64(&self) -> Result<u64, ShareError> {
        let bytes = hex::decode(&self.result).map_err(|_| ShareError::MalformedShare)?;

        if bytes.len() < RESULT_VALUE_OFFSET + RESULT_VALUE_LENGTH {
            return Err(ShareError::MalformedShare);
        }

        Ok(BigEndian::read_u64(
            &bytes[RESULT_VALUE_OFFSET..RESULT_VALUE_OFFSET + RESULT_VALUE_LENGTH],
        ))
    }
}
