use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::Map;
use crate::internal::filetransfer::paths::{base_name, join_relative};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Directory,
    /// Fetched by the receiver through a plugin.
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferItem {
    pub kind: ItemKind,
    /// Local path, or the URL for [`ItemKind::Url`].
    pub source: String,
    /// Path relative to the receiver's sandbox.
    pub dest_name: String,
    /// Set when the uploader delivers the file to a URL instead of the peer.
    pub dest_url: Option<String>,
    pub size: u64,
    pub mode: u32,
    pub executable: bool,
    pub is_symlink: bool,
}

impl FileTransferItem {
    fn url(url: &str, dest_dir: &str) -> Self {
        let name = url.rsplit('/').next().unwrap_or(url);
        FileTransferItem {
            kind: ItemKind::Url,
            source: url.to_string(),
            dest_name: join_relative(dest_dir, name),
            dest_url: None,
            size: 0,
            mode: 0o644,
            executable: false,
            is_symlink: false,
        }
    }
}

#[derive(Debug)]
pub struct ExpandError {
    pub entry: String,
    pub error: std::io::Error,
}

impl std::fmt::Display for ExpandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot read {}: {}", self.entry, self.error)
    }
}

pub fn url_scheme(entry: &str) -> Option<&str> {
    let (scheme, _) = entry.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Expands the configured entries into the flat, ordered list of items to send.
///
/// Directories produce a `Directory` item followed by their contents, sorted by
/// name. A trailing `/` sends only the contents. Symlinks to files are followed;
/// symlinked directories are refused because they may form cycles.
///
/// An entry that cannot be read does not stop the expansion; its error is
/// returned next to the items of every entry that could be read.
pub fn expand_file_list(
    entries: &[String],
    base_dir: &Path,
    executable: Option<&str>,
    output_destinations: &Map<String, String>,
) -> (Vec<FileTransferItem>, Vec<ExpandError>) {
    let mut items = Vec::new();
    let mut errors = Vec::new();
    for entry in entries {
        if url_scheme(entry).is_some() {
            items.push(FileTransferItem::url(entry, ""));
            continue;
        }
        let path = base_dir.join(entry);
        let contents_only = entry.ends_with('/');
        let name = base_name(entry);
        let start = items.len();
        expand_path(
            &path,
            entry,
            name,
            "",
            contents_only,
            &mut items,
            &mut errors,
        );
        if executable == Some(entry.as_str()) || executable == Some(name) {
            if let Some(item) = items.get_mut(start) {
                item.executable = true;
            }
        }
        for item in &mut items[start..] {
            if let Some(url) = output_destinations.get(&item.dest_name) {
                item.dest_url = Some(url.clone());
            }
        }
    }
    (items, errors)
}

fn expand_path(
    path: &Path,
    entry: &str,
    name: &str,
    dest_dir: &str,
    contents_only: bool,
    items: &mut Vec<FileTransferItem>,
    errors: &mut Vec<ExpandError>,
) {
    let err = |error| ExpandError {
        entry: entry.to_string(),
        error,
    };
    let metadata = fs::symlink_metadata(path).and_then(|link_meta| {
        fs::metadata(path).map(|meta| (link_meta.file_type().is_symlink(), meta))
    });
    let (is_symlink, meta) = match metadata {
        Ok(metadata) => metadata,
        Err(error) => {
            errors.push(err(error));
            return;
        }
    };
    let mode = meta.permissions().mode() & 0o7777;

    if meta.is_dir() {
        if is_symlink {
            errors.push(err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "symbolic links to directories are not transferred",
            )));
            return;
        }
        let child_dir = if contents_only {
            dest_dir.to_string()
        } else {
            let dest_name = join_relative(dest_dir, name);
            items.push(FileTransferItem {
                kind: ItemKind::Directory,
                source: path.display().to_string(),
                dest_name: dest_name.clone(),
                dest_url: None,
                size: 0,
                mode,
                executable: false,
                is_symlink: false,
            });
            dest_name
        };
        let listing = fs::read_dir(path).and_then(|dir| {
            dir.map(|e| e.map(|e| e.path()))
                .collect::<Result<Vec<PathBuf>, _>>()
        });
        let mut children = match listing {
            Ok(children) => children,
            Err(error) => {
                errors.push(err(error));
                return;
            }
        };
        children.sort();
        for child in children {
            let child_name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let child_entry = join_relative(entry.trim_end_matches('/'), &child_name);
            expand_path(
                &child,
                &child_entry,
                &child_name,
                &child_dir,
                false,
                items,
                errors,
            );
        }
    } else {
        items.push(FileTransferItem {
            kind: ItemKind::File,
            source: path.display().to_string(),
            dest_name: join_relative(dest_dir, name),
            dest_url: None,
            size: meta.len(),
            mode,
            executable: false,
            is_symlink,
        });
    }
}

pub(crate) fn sandbox_size(items: &[FileTransferItem]) -> u64 {
    items
        .iter()
        .filter(|item| item.dest_url.is_none())
        .map(|item| item.size)
        .sum()
}
