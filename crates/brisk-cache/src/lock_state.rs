use crate::error::{CacheError, Result};

/// On-disk representation of a [`LockState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockStateFormat {
    /// Version 3: creation number and sequence number, both 8-byte big endian.
    #[default]
    Sequenced,
    /// Version 1: a single dirty flag. Cannot detect writes by other processes.
    DirtyFlag,
}

impl LockStateFormat {
    pub fn version(self) -> u8 {
        match self {
            LockStateFormat::Sequenced => 3,
            LockStateFormat::DirtyFlag => 1,
        }
    }

    /// Size of the encoded record, version byte included.
    pub fn encoded_len(self) -> usize {
        match self {
            LockStateFormat::Sequenced => 17,
            LockStateFormat::DirtyFlag => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockStateFormat::Sequenced => "sequenced",
            LockStateFormat::DirtyFlag => "dirty-flag",
        }
    }

    /// State of a cache that has never been written.
    pub fn initial_state(self) -> Result<LockState> {
        Ok(match self {
            LockStateFormat::Sequenced => {
                let mut bytes = [0u8; 8];
                getrandom::getrandom(&mut bytes)?;
                LockState::Sequenced {
                    creation_number: i64::from_be_bytes(bytes),
                    original_sequence_number: NEVER_WRITTEN,
                    sequence_number: NEVER_WRITTEN,
                }
            }
            LockStateFormat::DirtyFlag => LockState::DirtyFlag { dirty: true },
        })
    }

    pub fn encode(self, state: &LockState) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.version());
        match (self, state) {
            (
                LockStateFormat::Sequenced,
                LockState::Sequenced {
                    creation_number,
                    sequence_number,
                    ..
                },
            ) => {
                out.extend_from_slice(&creation_number.to_be_bytes());
                out.extend_from_slice(&sequence_number.to_be_bytes());
            }
            (LockStateFormat::DirtyFlag, LockState::DirtyFlag { dirty }) => {
                out.push(u8::from(*dirty));
            }
            _ => {
                return Err(CacheError::LockProtocolViolation(format!(
                    "cannot encode {} lock state as {}",
                    state.format().as_str(),
                    self.as_str()
                )))
            }
        }
        Ok(out)
    }

    /// Decodes a record written by [`LockStateFormat::encode`]. The result counts as freshly
    /// read: its original and current sequence numbers are equal.
    pub fn decode(self, bytes: &[u8]) -> std::result::Result<LockState, DecodeError> {
        let Some((&version, payload)) = bytes.split_first() else {
            return Err(DecodeError::Truncated);
        };
        if version != self.version() {
            return Err(DecodeError::UnexpectedVersion {
                expected: self.version(),
                found: version,
            });
        }
        match self {
            LockStateFormat::Sequenced => {
                let (Some(creation), Some(sequence)) = (payload.get(..8), payload.get(8..16))
                else {
                    return Err(DecodeError::Truncated);
                };
                let sequence_number = i64::from_be_bytes(to_array(sequence));
                Ok(LockState::Sequenced {
                    creation_number: i64::from_be_bytes(to_array(creation)),
                    original_sequence_number: sequence_number,
                    sequence_number,
                })
            }
            LockStateFormat::DirtyFlag => match payload.first() {
                Some(flag) => Ok(LockState::DirtyFlag { dirty: *flag != 0 }),
                None => Err(DecodeError::Truncated),
            },
        }
    }
}

fn to_array(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    UnexpectedVersion { expected: u8, found: u8 },
}

/// Sequence number of a cache that has never been written.
pub const NEVER_WRITTEN: i64 = -1;
/// Sequence number while a write is in progress.
pub const DIRTY: i64 = 0;

/// Persisted state of a cache's lock file.
///
/// Every completed write advances the sequence number; comparing `(creation, sequence)` pairs
/// tells a process whether anyone wrote the cache since it last looked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    Sequenced {
        /// Random, assigned once when the cache is created.
        creation_number: i64,
        /// Sequence number when this state was read from disk.
        original_sequence_number: i64,
        sequence_number: i64,
    },
    DirtyFlag {
        dirty: bool,
    },
}

impl LockState {
    pub fn format(&self) -> LockStateFormat {
        match self {
            LockState::Sequenced { .. } => LockStateFormat::Sequenced,
            LockState::DirtyFlag { .. } => LockStateFormat::DirtyFlag,
        }
    }

    /// Whether the cache contents are suspect: never written, or a write did not complete.
    pub fn is_dirty(&self) -> bool {
        match self {
            LockState::Sequenced {
                sequence_number, ..
            } => *sequence_number == DIRTY || *sequence_number == NEVER_WRITTEN,
            LockState::DirtyFlag { dirty } => *dirty,
        }
    }

    pub fn is_in_initial_state(&self) -> bool {
        match self {
            LockState::Sequenced {
                original_sequence_number,
                ..
            } => *original_sequence_number <= DIRTY,
            LockState::DirtyFlag { .. } => false,
        }
    }

    /// The state to persist before a write begins.
    pub fn before_update(&self) -> LockState {
        match *self {
            LockState::Sequenced {
                creation_number,
                original_sequence_number,
                ..
            } => LockState::Sequenced {
                creation_number,
                original_sequence_number,
                sequence_number: DIRTY,
            },
            LockState::DirtyFlag { .. } => LockState::DirtyFlag { dirty: true },
        }
    }

    /// The state to persist once a write has completed.
    pub fn complete_update(&self) -> LockState {
        match *self {
            LockState::Sequenced {
                creation_number,
                original_sequence_number,
                ..
            } => {
                let next = if self.is_in_initial_state() {
                    1
                } else {
                    original_sequence_number + 1
                };
                LockState::Sequenced {
                    creation_number,
                    original_sequence_number: next,
                    sequence_number: next,
                }
            }
            LockState::DirtyFlag { .. } => LockState::DirtyFlag { dirty: false },
        }
    }

    /// Whether the cache was written since `prior` was observed.
    ///
    /// Fails for the dirty-flag format, which records no history.
    pub fn has_been_updated_since(&self, prior: &LockState) -> Result<bool> {
        match (self, prior) {
            (
                LockState::Sequenced {
                    creation_number,
                    sequence_number,
                    ..
                },
                LockState::Sequenced {
                    creation_number: prior_creation,
                    sequence_number: prior_sequence,
                    ..
                },
            ) => Ok(creation_number != prior_creation || sequence_number != prior_sequence),
            _ => Err(CacheError::UnsupportedLockStateOperation {
                operation: "has_been_updated_since",
                format: LockStateFormat::DirtyFlag.as_str(),
            }),
        }
    }
}
