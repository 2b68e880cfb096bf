//! Multi-path payloads.
//!
//! Any set of files and folders travels as one deflated zip archive. The
//! sender builds it in an anonymous temporary file so nothing is left behind
//! on any exit path. The receiver unpacks it under a destination directory
//! and refuses entries whose path would land outside of it.
//!
//! Archive layout: a file is stored under its own name, a folder under its
//! own name with its tree below it. Top-level names must be unique.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use log::{debug, info};
use walkdir::WalkDir;
use zip::write::{FileOptions, ZipWriter};
use zip::ZipArchive;

use crate::error::PortalError;
use crate::session::Payload;

/// Payload name when several paths are packed.
pub const DEFAULT_ARCHIVE_NAME: &str = "portal.zip";

fn prep(context: impl std::fmt::Display, e: impl std::fmt::Display) -> PortalError {
    PortalError::Preparation(format!("{}: {}", context, e))
}

/// Pack `paths` into one archive payload.
pub async fn pack(paths: Vec<PathBuf>) -> Result<Payload, PortalError> {
    let (name, file) = tokio::task::spawn_blocking(move || {
        let name = archive_name(&paths);
        pack_blocking(&paths).map(|file| (name, file))
    })
    .await
    .map_err(|e| prep("archive task", e))??;

    let size = file.metadata().map_err(|e| prep("archive", e))?.len();
    info!("packed {} into {} bytes", name, size);
    Ok(Payload::new(name, size, tokio::fs::File::from_std(file)))
}

/// `<name>.zip` for a single path, a generic name otherwise.
fn archive_name(paths: &[PathBuf]) -> String {
    match paths {
        [single] => single
            .file_name()
            .map(|n| format!("{}.zip", n.to_string_lossy()))
            .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string()),
        _ => DEFAULT_ARCHIVE_NAME.to_string(),
    }
}

/// Write the archive for `paths` into a temporary file, rewound to the start.
pub fn pack_blocking(paths: &[PathBuf]) -> Result<File, PortalError> {
    if paths.is_empty() {
        return Err(PortalError::Preparation("nothing to send".into()));
    }

    let tmp = tempfile::tempfile().map_err(|e| prep("temporary file", e))?;
    let mut zip = ZipWriter::new(tmp);
    let mut top_level = HashSet::new();

    for path in paths {
        let path = fs::canonicalize(path).map_err(|e| prep(path.display(), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PortalError::Preparation(format!("{}: no file name", path.display())))?;
        if !top_level.insert(name.clone()) {
            return Err(PortalError::Preparation(format!("{}: duplicate name", name)));
        }
        let base = path.parent().unwrap_or(Path::new("/"));

        for entry in WalkDir::new(&path) {
            let entry = entry.map_err(|e| prep(path.display(), e))?;
            let entry_name = entry_name(entry.path(), base)?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                debug!("adding directory {}/", entry_name);
                zip.add_directory(format!("{}/", entry_name), options(0))
                    .map_err(|e| prep(&entry_name, e))?;
            } else if file_type.is_file() {
                let mut source =
                    File::open(entry.path()).map_err(|e| prep(entry.path().display(), e))?;
                let len = source.metadata().map_err(|e| prep(&entry_name, e))?.len();
                debug!("adding file {} ({} bytes)", entry_name, len);
                zip.start_file(entry_name.clone(), options(len))
                    .map_err(|e| prep(&entry_name, e))?;
                io::copy(&mut source, &mut zip).map_err(|e| prep(&entry_name, e))?;
            } else {
                debug!("skipping {}: not a file or directory", entry_name);
            }
        }
    }

    let mut file = zip.finish().map_err(|e| prep("archive", e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| prep("archive", e))?;
    Ok(file)
}

fn options(len: u64) -> FileOptions<'static, ()> {
    FileOptions::<()>::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(len >= u64::from(u32::MAX))
}

/// Archive entry name of `path` relative to `base`, `/`-separated.
fn entry_name(path: &Path, base: &Path) -> Result<String, PortalError> {
    let relative = path
        .strip_prefix(base)
        .map_err(|e| prep(path.display(), e))?;
    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part
                .to_str()
                .ok_or_else(|| PortalError::Preparation(format!("{}: name is not UTF-8", path.display()))),
            _ => Err(PortalError::Preparation(format!("{}: unexpected path component", path.display()))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("/"))
}

/// Unpack `archive` under `dest` and return the top-level paths it created.
pub async fn unpack(archive: File, dest: PathBuf) -> Result<Vec<PathBuf>, PortalError> {
    tokio::task::spawn_blocking(move || unpack_blocking(archive, &dest))
        .await
        .map_err(|e| prep("unpack task", e))?
}

/// Blocking body of [`unpack`].
///
/// Existing files are never overwritten.
pub fn unpack_blocking(archive: File, dest: &Path) -> Result<Vec<PathBuf>, PortalError> {
    let mut archive = ZipArchive::new(archive).map_err(|e| prep("archive", e))?;
    debug!("unpacking {} entries into {}", archive.len(), dest.display());

    let mut created: Vec<PathBuf> = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| prep("archive", e))?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            PortalError::Preparation(format!("{}: unsafe path in archive", entry.name()))
        })?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| prep(target.display(), e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| prep(parent.display(), e))?;
            }
            let mut out = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .map_err(|e| prep(target.display(), e))?;
            io::copy(&mut entry, &mut out).map_err(|e| prep(target.display(), e))?;
        }

        if let Some(first) = relative.components().next() {
            let top = dest.join(first);
            if !created.contains(&top) {
                created.push(top);
            }
        }
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_tree(root: &Path) -> (PathBuf, PathBuf) {
        let folder = root.join("photos");
        fs::create_dir_all(folder.join("nested/empty")).unwrap();
        fs::write(folder.join("a.txt"), b"alpha").unwrap();
        fs::write(folder.join("nested/b.bin"), vec![0xAAu8; 10_240]).unwrap();
        let loose = root.join("notes.txt");
        fs::write(&loose, b"loose file").unwrap();
        (folder, loose)
    }

    #[test]
    fn test_pack_unpack_folder_and_file() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let (folder, loose) = sample_tree(src.path());

        let archive = pack_blocking(&[folder, loose]).unwrap();
        let mut created = unpack_blocking(archive, dest.path()).unwrap();
        created.sort();

        assert_eq!(
            created,
            vec![dest.path().join("notes.txt"), dest.path().join("photos")]
        );
        assert_eq!(fs::read(dest.path().join("photos/a.txt")).unwrap(), b"alpha");
        assert_eq!(
            fs::read(dest.path().join("photos/nested/b.bin")).unwrap(),
            vec![0xAAu8; 10_240]
        );
        assert!(dest.path().join("photos/nested/empty").is_dir());
        assert_eq!(fs::read(dest.path().join("notes.txt")).unwrap(), b"loose file");
    }

    #[tokio::test]
    async fn test_pack_payload_size_matches_archive() {
        let src = tempfile::tempdir().unwrap();
        let (folder, _) = sample_tree(src.path());

        let mut payload = pack(vec![folder]).await.unwrap();
        assert_eq!(payload.name, "photos.zip");

        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut payload.reader, &mut bytes)
            .await
            .unwrap();
        assert_eq!(bytes.len() as u64, payload.size);
        // Deflate shrinks the repeated bytes
        assert!(payload.size < 10_240);
    }

    #[test]
    fn test_pack_rejects_empty_and_missing() {
        assert!(matches!(pack_blocking(&[]), Err(PortalError::Preparation(_))));
        assert!(matches!(
            pack_blocking(&[PathBuf::from("/definitely/not/here")]),
            Err(PortalError::Preparation(_))
        ));
    }

    #[test]
    fn test_pack_rejects_duplicate_top_level_names() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("one")).unwrap();
        fs::create_dir_all(src.path().join("two")).unwrap();
        fs::write(src.path().join("one/same.txt"), b"1").unwrap();
        fs::write(src.path().join("two/same.txt"), b"2").unwrap();

        let result = pack_blocking(&[
            src.path().join("one/same.txt"),
            src.path().join("two/same.txt"),
        ]);
        assert!(matches!(result, Err(PortalError::Preparation(_))));
    }

    fn archive_with_entry(name: &str) -> File {
        let mut zip = ZipWriter::new(tempfile::tempfile().unwrap());
        zip.start_file(name, options(4)).unwrap();
        zip.write_all(b"evil").unwrap();
        let mut file = zip.finish().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    #[test]
    fn test_unpack_rejects_escaping_paths() {
        let outer = tempfile::tempdir().unwrap();
        let dest = outer.path().join("inbox");
        fs::create_dir_all(&dest).unwrap();

        let result = unpack_blocking(archive_with_entry("../escaped.txt"), &dest);
        assert!(matches!(result, Err(PortalError::Preparation(_))));
        assert!(!outer.path().join("escaped.txt").exists());

        let result = unpack_blocking(archive_with_entry("/tmp/portal-absolute.txt"), &dest);
        assert!(matches!(result, Err(PortalError::Preparation(_))));
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_unpack_never_overwrites() {
        let dest = tempfile::tempdir().unwrap();
        fs::write(dest.path().join("keep.txt"), b"original").unwrap();

        let result = unpack_blocking(archive_with_entry("keep.txt"), dest.path());
        assert!(matches!(result, Err(PortalError::Preparation(_))));
        assert_eq!(fs::read(dest.path().join("keep.txt")).unwrap(), b"original");
    }

    #[test]
    fn test_entry_name_uses_forward_slashes() {
        let base = Path::new("/data");
        assert_eq!(
            entry_name(Path::new("/data/photos/nested/b.bin"), base).unwrap(),
            "photos/nested/b.bin"
        );
    }
}
