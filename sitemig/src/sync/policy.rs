use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use sitemig_core::{DOCUMENT_MIME, DOCX_MIME};
use time::OffsetDateTime;

use super::SyncError;
use super::store::RemoteFile;

/// Office documents above this size are never converted to native documents.
pub const CONVERSION_LIMIT: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    UploadAll,
    KeepRemote,
    Overwrite,
    OverwriteOlder,
    Convert,
    ScanOnly,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::UploadAll => "uploadAll",
            SyncMode::KeepRemote => "keepRemote",
            SyncMode::Overwrite => "overwrite",
            SyncMode::OverwriteOlder => "overwriteOlder",
            SyncMode::Convert => "convert",
            SyncMode::ScanOnly => "scanonly",
        }
    }

    /// Whether deciding needs the remote files matching the local name.
    pub fn needs_matches(self) -> bool {
        !matches!(self, SyncMode::UploadAll | SyncMode::ScanOnly)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uploadall" | "upload-all" => Ok(SyncMode::UploadAll),
            "keepremote" | "keep-remote" => Ok(SyncMode::KeepRemote),
            "overwrite" => Ok(SyncMode::Overwrite),
            "overwriteolder" | "overwrite-older" => Ok(SyncMode::OverwriteOlder),
            "convert" => Ok(SyncMode::Convert),
            "scanonly" | "scan-only" => Ok(SyncMode::ScanOnly),
            _ => Err(SyncError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Slash-delimited path relative to the upload source.
    pub rel_path: String,
    pub size: u64,
    pub modified: Option<OffsetDateTime>,
}

impl LocalFile {
    pub fn name(&self) -> &str {
        self.rel_path
            .rsplit_once('/')
            .map_or(self.rel_path.as_str(), |(_, name)| name)
    }

    pub fn stem(&self) -> &str {
        let name = self.name();
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        }
    }

    /// Folder segments of `rel_path`, excluding the file name.
    pub fn folder(&self) -> &str {
        self.rel_path.rsplit_once('/').map_or("", |(dir, _)| dir)
    }

    pub fn is_docx(&self) -> bool {
        self.name().to_ascii_lowercase().ends_with(".docx")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    UploadOnly,
    DeleteThenUpload(Vec<String>),
    Skip,
    ConvertOnly(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Convert,
    TooLarge,
    NotApplicable,
}

/// Whether an uploaded file should be turned into a native document.
pub fn conversion_for(local: &LocalFile, enabled: bool) -> Conversion {
    if !enabled || !local.is_docx() {
        Conversion::NotApplicable
    } else if local.size > CONVERSION_LIMIT {
        Conversion::TooLarge
    } else {
        Conversion::Convert
    }
}

/// Drops repeated ids; the exact-name and stem lookups can both return the
/// same remote file.
pub fn dedup_matches(matches: Vec<RemoteFile>) -> Vec<RemoteFile> {
    let mut seen = HashSet::new();
    matches
        .into_iter()
        .filter(|file| seen.insert(file.id.clone()))
        .collect()
}

/// Remote files count as matches when named like the local file, with or
/// without its extension. Folders never match.
pub fn is_match(local: &LocalFile, remote: &RemoteFile) -> bool {
    !remote.is_folder() && (remote.name == local.name() || remote.name == local.stem())
}

pub fn decide(mode: SyncMode, local: &LocalFile, remote: &[RemoteFile]) -> SyncAction {
    let matches: Vec<&RemoteFile> = {
        let mut seen = HashSet::new();
        remote
            .iter()
            .filter(|file| is_match(local, file) && seen.insert(file.id.as_str()))
            .collect()
    };

    match mode {
        SyncMode::UploadAll => SyncAction::UploadOnly,
        SyncMode::ScanOnly => SyncAction::Skip,
        SyncMode::KeepRemote => {
            if matches.is_empty() {
                SyncAction::UploadOnly
            } else {
                SyncAction::Skip
            }
        }
        SyncMode::Overwrite => {
            if matches.is_empty() {
                SyncAction::UploadOnly
            } else {
                SyncAction::DeleteThenUpload(matches.iter().map(|f| f.id.clone()).collect())
            }
        }
        SyncMode::OverwriteOlder => {
            if matches.is_empty() {
                return SyncAction::UploadOnly;
            }
            let older: Vec<String> = matches
                .iter()
                .filter(|file| is_older(file, local))
                .map(|file| file.id.clone())
                .collect();
            if older.is_empty() {
                SyncAction::Skip
            } else {
                SyncAction::DeleteThenUpload(older)
            }
        }
        SyncMode::Convert => {
            if !local.is_docx() || local.size > CONVERSION_LIMIT {
                return SyncAction::Skip;
            }
            let native = matches
                .iter()
                .any(|f| f.mime_type == DOCUMENT_MIME && f.name == local.stem());
            let uploaded = matches
                .iter()
                .find(|f| f.name == local.name() && f.mime_type == DOCX_MIME);
            match uploaded {
                Some(docx) if !native => SyncAction::ConvertOnly(docx.id.clone()),
                _ => SyncAction::Skip,
            }
        }
    }
}

// A remote file without a modification time is never considered older.
fn is_older(remote: &RemoteFile, local: &LocalFile) -> bool {
    match (remote.modified_time, local.modified) {
        (Some(remote), Some(local)) => remote < local,
        _ => false,
    }
}
