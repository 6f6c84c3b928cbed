use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::time::Duration;

use brisk_hash::HashCode;

use crate::error::{CacheError, Result};
use crate::lock::LockMode;
use crate::persistent::{IndexedCache, PersistentCache};

pub const METADATA_ENTRY: &str = "METADATA";
pub const OUTPUT_ENTRY: &str = "output.bin";

const TYPE: &str = "type";
const IDENTITY: &str = "identity";
const TOOL_VERSION: &str = "toolVersion";
const CREATION_TIME: &str = "creationTime";
const EXECUTION_TIME: &str = "executionTime";
const ROOT_PATH: &str = "rootPath";
const OPERATING_SYSTEM: &str = "operatingSystem";
const HOST_NAME: &str = "hostName";
const USER_NAME: &str = "userName";
const BUILD_INVOCATION_ID: &str = "buildInvocationId";

/// Where and how a cached result was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginMetadata {
    /// Kind of unit of work that produced the result.
    pub entry_type: String,
    /// Logical path of the unit of work.
    pub identity: String,
    pub tool_version: String,
    /// Milliseconds since the unix epoch.
    pub creation_time: u64,
    /// How long producing the result took, in milliseconds.
    pub execution_time: u64,
    pub root_path: String,
    pub operating_system: String,
    pub host_name: String,
    pub user_name: String,
    pub build_invocation_id: Option<String>,
}

impl OriginMetadata {
    /// Metadata for a result produced now, on this host, by this version of Brisk.
    pub fn for_current_host(
        entry_type: impl Into<String>,
        identity: impl Into<String>,
        root_path: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            entry_type: entry_type.into(),
            identity: identity.into(),
            tool_version: brisk_core::BRISK_VERSION.to_string(),
            creation_time: brisk_core::now_millis(),
            execution_time: u64::try_from(execution_time.as_millis()).unwrap_or(u64::MAX),
            root_path: root_path.into(),
            operating_system: std::env::consts::OS.to_string(),
            host_name: env_or_unknown(&["HOSTNAME", "COMPUTERNAME"]),
            user_name: env_or_unknown(&["USER", "USERNAME"]),
            build_invocation_id: None,
        }
    }

    pub fn with_build_invocation_id(mut self, id: impl Into<String>) -> Self {
        self.build_invocation_id = Some(id.into());
        self
    }

    /// `key=value` lines, one per field.
    pub fn to_text(&self) -> String {
        let mut fields = vec![
            (TYPE, self.entry_type.clone()),
            (IDENTITY, self.identity.clone()),
            (TOOL_VERSION, self.tool_version.clone()),
            (CREATION_TIME, self.creation_time.to_string()),
            (EXECUTION_TIME, self.execution_time.to_string()),
            (ROOT_PATH, self.root_path.clone()),
            (OPERATING_SYSTEM, self.operating_system.clone()),
            (HOST_NAME, self.host_name.clone()),
            (USER_NAME, self.user_name.clone()),
        ];
        if let Some(id) = &self.build_invocation_id {
            fields.push((BUILD_INVOCATION_ID, id.clone()));
        }

        let mut out = String::new();
        for (key, value) in fields {
            out.push_str(key);
            out.push('=');
            out.push_str(&escape(&value));
            out.push('\n');
        }
        out
    }

    /// Parses [`OriginMetadata::to_text`] output. Every field but the invocation id is required.
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for line in text.lines().filter(|line| !line.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                return Err(CacheError::CorruptEntry(format!(
                    "malformed origin metadata line '{line}'"
                )));
            };
            values.insert(key, unescape(value)?);
        }

        let mut take = |key: &'static str| {
            values
                .remove(key)
                .ok_or_else(|| CacheError::CorruptEntry(format!("origin metadata lacks '{key}'")))
        };
        let entry_type = take(TYPE)?;
        let identity = take(IDENTITY)?;
        let tool_version = take(TOOL_VERSION)?;
        let creation_time = parse_millis(CREATION_TIME, &take(CREATION_TIME)?)?;
        let execution_time = parse_millis(EXECUTION_TIME, &take(EXECUTION_TIME)?)?;
        let root_path = take(ROOT_PATH)?;
        let operating_system = take(OPERATING_SYSTEM)?;
        let host_name = take(HOST_NAME)?;
        let user_name = take(USER_NAME)?;
        let build_invocation_id = take(BUILD_INVOCATION_ID).ok();
        Ok(Self {
            entry_type,
            identity,
            tool_version,
            creation_time,
            execution_time,
            root_path,
            operating_system,
            host_name,
            user_name,
            build_invocation_id,
        })
    }
}

fn env_or_unknown(names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        CacheError::CorruptEntry(format!("origin metadata '{key}' is not a number: '{value}'"))
    })
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            _ => {
                return Err(CacheError::CorruptEntry(format!(
                    "invalid escape in origin metadata value '{value}'"
                )))
            }
        }
    }
    Ok(out)
}

/// A cached result together with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCacheEntry {
    pub origin: OriginMetadata,
    pub output: Vec<u8>,
}

/// Packs an entry as a tar archive holding [`METADATA_ENTRY`] and [`OUTPUT_ENTRY`].
pub fn pack_entry(origin: &OriginMetadata, output: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let metadata = origin.to_text().into_bytes();
    for (name, bytes) in [(METADATA_ENTRY, metadata.as_slice()), (OUTPUT_ENTRY, output)] {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(origin.creation_time / 1000);
        header.set_cksum();
        builder.append_data(&mut header, name, Cursor::new(bytes))?;
    }
    Ok(builder.into_inner()?)
}

pub fn unpack_entry(bytes: &[u8]) -> Result<BuildCacheEntry> {
    let mut origin = None;
    let mut output = None;
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        match path.as_str() {
            METADATA_ENTRY => {
                let text = String::from_utf8(content).map_err(|_| {
                    CacheError::CorruptEntry("origin metadata is not UTF-8".to_string())
                })?;
                origin = Some(OriginMetadata::parse(&text)?);
            }
            OUTPUT_ENTRY => output = Some(content),
            other => {
                return Err(CacheError::CorruptEntry(format!(
                    "unexpected archive entry '{other}'"
                )))
            }
        }
    }

    match (origin, output) {
        (Some(origin), Some(output)) => Ok(BuildCacheEntry { origin, output }),
        (None, _) => Err(CacheError::CorruptEntry(format!("missing {METADATA_ENTRY}"))),
        (_, None) => Err(CacheError::CorruptEntry(format!("missing {OUTPUT_ENTRY}"))),
    }
}

/// Results of units of work keyed by the hash of their inputs.
#[derive(Clone)]
pub struct BuildCache {
    entries: IndexedCache<HashCode, Vec<u8>>,
    writable: bool,
}

impl BuildCache {
    pub const CACHE_NAME: &'static str = "build-cache";

    pub fn new(cache: &PersistentCache) -> Result<Self> {
        Ok(Self {
            entries: cache.indexed_cache(Self::CACHE_NAME)?,
            writable: cache.mode() != LockMode::Shared,
        })
    }

    pub fn store(&self, key: &HashCode, origin: &OriginMetadata, output: &[u8]) -> Result<()> {
        self.entries.put(key, pack_entry(origin, output)?)
    }

    /// The entry stored under `key`. Missing and corrupt entries are both `None`.
    pub fn load(&self, key: &HashCode) -> Result<Option<BuildCacheEntry>> {
        let Some(bytes) = self.entries.get(key)? else {
            return Ok(None);
        };
        match unpack_entry(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                tracing::debug!(
                    target = "brisk.cache",
                    key = %key.to_hex(),
                    error = %err,
                    "discarding corrupt build cache entry"
                );
                if self.writable {
                    if let Err(err) = self.entries.remove(key) {
                        tracing::debug!(
                            target = "brisk.cache",
                            key = %key.to_hex(),
                            error = %err,
                            "failed to remove corrupt build cache entry"
                        );
                    }
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> OriginMetadata {
        OriginMetadata {
            entry_type: "compile".to_string(),
            identity: ":app:compileJava".to_string(),
            tool_version: "0.1.0".to_string(),
            creation_time: 1_700_000_000_000,
            execution_time: 1250,
            root_path: "/work/app".to_string(),
            operating_system: "linux".to_string(),
            host_name: "ci-7".to_string(),
            user_name: "builder".to_string(),
            build_invocation_id: None,
        }
    }

    #[test]
    fn text_escapes_separators() {
        let mut origin = origin();
        origin.root_path = "C:\\work\nsecond=line".to_string();
        let origin = origin.with_build_invocation_id("inv-1");
        let parsed = OriginMetadata::parse(&origin.to_text()).unwrap();
        assert_eq!(parsed, origin);
    }

    #[test]
    fn every_required_key_is_checked() {
        let text = origin().to_text();
        for key in [
            TYPE,
            IDENTITY,
            TOOL_VERSION,
            CREATION_TIME,
            EXECUTION_TIME,
            ROOT_PATH,
            OPERATING_SYSTEM,
            HOST_NAME,
            USER_NAME,
        ] {
            let without: String = text
                .lines()
                .filter(|line| !line.starts_with(&format!("{key}=")))
                .map(|line| format!("{line}\n"))
                .collect();
            assert!(
                matches!(OriginMetadata::parse(&without), Err(CacheError::CorruptEntry(_))),
                "{key}"
            );
        }
    }

    #[test]
    fn archives_hold_metadata_and_output() {
        let bytes = pack_entry(&origin(), b"result").unwrap();
        let entry = unpack_entry(&bytes).unwrap();
        assert_eq!(entry.origin, origin());
        assert_eq!(entry.output, b"result");

        assert!(unpack_entry(b"not a tar archive").is_err());
    }

    #[test]
    fn host_metadata_is_filled_in() {
        let origin = OriginMetadata::for_current_host("test", ":a", "/r", Duration::from_secs(2));
        assert_eq!(origin.execution_time, 2000);
        assert_eq!(origin.tool_version, brisk_core::BRISK_VERSION);
        assert_eq!(origin.operating_system, std::env::consts::OS);
        assert!(!origin.host_name.is_empty());
    }
}
