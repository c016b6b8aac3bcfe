//! Per-module settings digests used for change detection.

use sha2::{Digest, Sha256};
use std::fmt;

/// Running hash over every `name = value` pair one module saw in one pass.
#[derive(Clone, Default)]
pub struct SettingsHasher {
    inner: Sha256,
    entries: usize,
}

impl SettingsHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, name: &str, value: &str) {
        self.inner.update(name.as_bytes());
        self.inner.update(b"\0");
        self.inner.update(value.as_bytes());
        self.inner.update(b"\0");
        self.entries += 1;
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn finalize(self) -> SettingsDigest {
        SettingsDigest(self.inner.finalize().into())
    }
}

/// Finalized digest value; compared byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SettingsDigest([u8; 32]);

impl SettingsDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SettingsDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SettingsDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SettingsDigest({})", self)
    }
}
