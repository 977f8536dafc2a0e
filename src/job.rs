use {
    super::*,
    byteorder::{BigEndian, ByteOrder},
    snafu::Snafu,
};

pub(crate) const NONCE_OFFSET: usize = 39;
pub(crate) const NONCE_LENGTH: usize = 4;

/// Width of the nonce window reserved for each sub-job, plenty of work for
/// one miner on one block.
pub const NONCE_STRIDE: u32 = 0x7a120;

const MAX_NONCE: u32 = u32::MAX - NONCE_STRIDE;

#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum JobError {
    #[snafu(display("bad job format from pool"))]
    Malformed,

    #[snafu(display("job blob is not valid hex: {source}"))]
    BadBlobHex { source: hex::FromHexError },

    #[snafu(display("job blob is too short: {len} bytes"))]
    BlobTooShort { len: usize },

    #[snafu(display("unrecognized format for job target"))]
    UnknownTargetFormat,
}

/// One pool job. The proxy breaks it up and hands chunks of its nonce
/// space to workers.
#[derive(Debug, PartialEq)]
pub struct Job {
    id: String,
    target: String,
    blob: Vec<u8>,
    initial_nonce: u32,
    current_nonce: u32,
    submitted_nonces: HashSet<String>,
}

impl Job {
    /// Builds a job from the params of a pool push or login reply.
    pub fn from_params(params: &Value) -> Result<Self, JobError> {
        let field = |key| {
            params
                .get(key)
                .and_then(Value::as_str)
                .ok_or(JobError::Malformed)
        };

        Self::new(field("blob")?, field("job_id")?, field("target")?)
    }

    pub fn new(blob: &str, id: &str, target: &str) -> Result<Self, JobError> {
        let blob = hex::decode(blob).map_err(|source| JobError::BadBlobHex { source })?;

        if blob.len() < NONCE_OFFSET + NONCE_LENGTH {
            return Err(JobError::BlobTooShort { len: blob.len() });
        }

        let initial_nonce = BigEndian::read_u32(&blob[NONCE_OFFSET..NONCE_OFFSET + NONCE_LENGTH]);

        Ok(Self {
            id: id.into(),
            target: target.into(),
            blob,
            initial_nonce,
            current_nonce: initial_nonce,
            submitted_nonces: HashSet::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Where the nonce cursor started, as read out of the blob.
    pub fn initial_nonce(&self) -> u32 {
        self.initial_nonce
    }

    pub fn current_nonce(&self) -> u32 {
        self.current_nonce
    }

    /// Carves the next nonce window out of this job: the cursor is written
    /// into the blob's nonce field and the cursor advances one stride,
    /// wrapping to 1 near the top of the u32 range.
    pub fn next_sub_job(&mut self) -> SubJob {
        let mut blob = self.blob.clone();
        BigEndian::write_u32(
            &mut blob[NONCE_OFFSET..NONCE_OFFSET + NONCE_LENGTH],
            self.current_nonce,
        );

        let sub_job = SubJob {
            blob: hex::encode(blob),
            job_id: self.id.clone(),
            target: self.target.clone(),
        };

        self.current_nonce = self.current_nonce.wrapping_add(NONCE_STRIDE);
        if self.current_nonce >= MAX_NONCE {
            self.current_nonce = 1;
        }

        sub_job
    }

    pub(crate) fn seen_nonce(&self, nonce: &str) -> bool {
        self.submitted_nonces.contains(nonce)
    }

    pub(crate) fn record_nonce(&mut self, nonce: &str) {
        self.submitted_nonces.insert(nonce.into());
    }

    /// Expands the compact hex target into the 64-bit threshold used by the
    /// experimental difficulty check. A 32-bit target occupies the high
    /// half of the u64.
    pub fn target_as_u64(&self) -> Result<u64, JobError> {
        let mut target = self.target.clone();

        if target.len() == 8 {
            target.push_str("00000000");
        }

        if target.len() != 16 {
            return Err(JobError::UnknownTargetFormat);
        }

        let bytes = hex::decode(&target).map_err(|_| JobError::UnknownTargetFormat)?;

        Ok(BigEndian::read_u64(&bytes))
    }
}

/// A job cut down for one worker: same id and target, blob stamped with the
/// worker's starting nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubJob {
    pub blob: String,
    pub job_id: String,
    pub target: String,
}

impl SubJob {
    /// The nonce written into this sub-job's blob.
    pub fn nonce(&self) -> Option<u32> {
        let blob = hex::decode(&self.blob).ok()?;
        blob.get(NONCE_OFFSET..NONCE_OFFSET + NONCE_LENGTH)
            .map(BigEndian::read_u32)
    }
}
