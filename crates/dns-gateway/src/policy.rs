//! Static whitelist and blacklist, loaded once at startup.

use serde::Deserialize;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use crate::normalise::{normalise_str, NormalisedDomain};

/// Name of the column holding the domain in a policy list.
pub const DOMAIN_COLUMN: &str = "domain";

/// Which list, if any, a domain is in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PolicyVerdict {
    Whitelisted,
    Blacklisted,
    Unknown,
}

impl PolicyVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyVerdict::Whitelisted => "whitelisted",
            PolicyVerdict::Blacklisted => "blacklisted",
            PolicyVerdict::Unknown => "unknown",
        }
    }
}

/// The two policy lists.  Immutable once built: share it behind an
/// `Arc` and read it from any number of tasks.
///
/// A domain in both lists is whitelisted.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    whitelist: HashSet<NormalisedDomain>,
    blacklist: HashSet<NormalisedDomain>,
}

impl PolicyStore {
    /// Empty domains are dropped: they must never match.
    pub fn new<W, B>(whitelist: W, blacklist: B) -> Self
    where
        W: IntoIterator<Item = NormalisedDomain>,
        B: IntoIterator<Item = NormalisedDomain>,
    {
        Self {
            whitelist: whitelist.into_iter().filter(|d| !d.is_empty()).collect(),
            blacklist: blacklist.into_iter().filter(|d| !d.is_empty()).collect(),
        }
    }

    /// Load both lists from CSV files.
    ///
    /// # Errors
    ///
    /// If either file cannot be read or parsed.  The gateway must not
    /// start with a partial policy.
    pub fn from_csv_files(whitelist: &Path, blacklist: &Path) -> Result<Self, PolicyLoadError> {
        Ok(Self::new(
            read_domain_list_file(whitelist)?,
            read_domain_list_file(blacklist)?,
        ))
    }

    pub fn lookup(&self, domain: &NormalisedDomain) -> PolicyVerdict {
        if self.whitelist.contains(domain) {
            PolicyVerdict::Whitelisted
        } else if self.blacklist.contains(domain) {
            PolicyVerdict::Blacklisted
        } else {
            PolicyVerdict::Unknown
        }
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.len()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }
}

#[derive(Debug, Deserialize)]
struct Row {
    domain: String,
}

/// Read and normalise the `domain` column of a CSV file.
///
/// # Errors
///
/// If the file cannot be opened or is not a valid policy list.
pub fn read_domain_list_file(path: &Path) -> Result<Vec<NormalisedDomain>, PolicyLoadError> {
    let file = std::fs::File::open(path).map_err(|source| PolicyLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_domain_list(file).map_err(|error| error.with_path(path))
}

/// Read and normalise the `domain` column of CSV data.  The data must
/// have a header row; other columns are ignored.
///
/// # Errors
///
/// If the data has no `domain` column or a row cannot be parsed.
pub fn read_domain_list<R: io::Read>(reader: R) -> Result<Vec<NormalisedDomain>, PolicyLoadError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);

    let headers = reader.headers().map_err(PolicyLoadError::from_csv)?;
    if !headers.iter().any(|h| h.trim() == DOMAIN_COLUMN) {
        return Err(PolicyLoadError::MissingDomainColumn {
            path: PathBuf::new(),
        });
    }

    let mut domains = Vec::new();
    let mut skipped = 0;
    for row in reader.deserialize::<Row>() {
        let row = row.map_err(PolicyLoadError::from_csv)?;
        let domain = normalise_str(&row.domain);
        if domain.is_empty() {
            skipped += 1;
        } else {
            domains.push(domain);
        }
    }

    if skipped > 0 {
        tracing::warn!(%skipped, "ignored policy list entries with no registrable domain");
    }

    Ok(domains)
}

/// A policy list could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum PolicyLoadError {
    #[error("could not read {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("could not parse {}: {source}", .path.display())]
    Parse { path: PathBuf, source: csv::Error },

    #[error("{} has no 'domain' column", .path.display())]
    MissingDomainColumn { path: PathBuf },
}

impl PolicyLoadError {
    fn from_csv(source: csv::Error) -> Self {
        PolicyLoadError::Parse {
            path: PathBuf::new(),
            source,
        }
    }

    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            PolicyLoadError::Io { source, .. } => PolicyLoadError::Io { path, source },
            PolicyLoadError::Parse { source, .. } => PolicyLoadError::Parse { path, source },
            PolicyLoadError::MissingDomainColumn { .. } => {
                PolicyLoadError::MissingDomainColumn { path }
            }
        }
    }
}
