//! Workspace capabilities a stage may be granted.
//!
//! Grants are compile-time constants on each stage agent. The gateway passes the
//! grant to the completion service and audits the transcript against it.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ReadFile,
    WriteFile,
    EditFile,
    RunShell,
    SearchContents,
    ListFiles,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::ReadFile,
        Capability::WriteFile,
        Capability::EditFile,
        Capability::RunShell,
        Capability::SearchContents,
        Capability::ListFiles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ReadFile => "read-file",
            Capability::WriteFile => "write-file",
            Capability::EditFile => "edit-file",
            Capability::RunShell => "run-shell",
            Capability::SearchContents => "search-contents",
            Capability::ListFiles => "list-files",
        }
    }

    /// True for capabilities that can change the workspace.
    pub fn mutates_workspace(self) -> bool {
        matches!(
            self,
            Capability::WriteFile | Capability::EditFile | Capability::RunShell
        )
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable set of capabilities.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn of(caps: &[Capability]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < caps.len() {
            bits |= caps[i].bit();
            i += 1;
        }
        Self(bits)
    }

    pub const fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .into_iter()
            .filter(move |cap| self.contains(*cap))
    }

    /// Capabilities outside this set.
    pub fn complement(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .into_iter()
            .filter(move |cap| !self.contains(*cap))
    }

    pub fn is_read_only(self) -> bool {
        !self.iter().any(Capability::mutates_workspace)
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}
