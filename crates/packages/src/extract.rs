use flate2::read::GzDecoder;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::{Error, MAX_MEMBER_BYTES, MAX_TOTAL_BYTES};

/// Members may nest at most this many path components deep:
/// `<top>/<subtree>/<dir>/<file>` covers the depth-2 subtrees the package
/// contract allows.
const MAX_PATH_COMPONENTS: usize = 4;

#[derive(Debug)]
pub struct ExtractedPackage {
    /// Directory the archive was unpacked into.
    pub root: PathBuf,
    /// The single top-level directory inside `root`; its name must equal
    /// the external event identifier (checked by the payload validator).
    pub top_dir: String,
    pub uncompressed_bytes: u64,
}

impl ExtractedPackage {
    /// Absolute path of the package's top-level directory.
    pub fn package_dir(&self) -> PathBuf {
        self.root.join(&self.top_dir)
    }
}

/// Unpack a tar+gzip archive into `dest`. Synchronous; callers run it on
/// a blocking thread. Every member path is confined to `dest` and the
/// member/total size caps are enforced on actual uncompressed bytes.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ExtractedPackage, Error> {
    let file = fs::File::open(archive)?;
    let decoder = GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    let mut total: u64 = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;

        let path = entry
            .path()
            .map_err(|err| Error::MalformedArchive(format!("unreadable member path: {err}")))?
            .into_owned();
        check_member_path(&path)?;

        match entry.header().entry_type() {
            tar::EntryType::Regular | tar::EntryType::Directory => {}
            other => {
                return Err(Error::MalformedArchive(format!(
                    "member {} has unsupported type {:?}",
                    path.display(),
                    other
                )));
            }
        }

        let size = entry.header().size()?;
        if size > MAX_MEMBER_BYTES {
            return Err(Error::PayloadTooLarge {
                what: "archive member",
                actual: size,
                limit: MAX_MEMBER_BYTES,
            });
        }
        total += size;
        if total > MAX_TOTAL_BYTES {
            return Err(Error::PayloadTooLarge {
                what: "uncompressed package",
                actual: total,
                limit: MAX_TOTAL_BYTES,
            });
        }

        // unpack_in re-checks containment against dest as a backstop.
        if !entry.unpack_in(dest)? {
            return Err(Error::MalformedArchive(format!(
                "member {} escapes the extraction root",
                path.display()
            )));
        }
    }

    let top_dir = single_top_dir(dest)?;
    Ok(ExtractedPackage {
        root: dest.to_path_buf(),
        top_dir,
        uncompressed_bytes: total,
    })
}

fn check_member_path(path: &Path) -> Result<(), Error> {
    let mut components = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => components += 1,
            Component::CurDir => {}
            _ => {
                return Err(Error::MalformedArchive(format!(
                    "member path {} is absolute or escapes the extraction root",
                    path.display()
                )));
            }
        }
    }
    if components == 0 {
        return Err(Error::MalformedArchive("empty member path".to_string()));
    }
    if components > MAX_PATH_COMPONENTS {
        return Err(Error::MalformedArchive(format!(
            "member path {} nests deeper than the package contract allows",
            path.display()
        )));
    }
    Ok(())
}

fn single_top_dir(dest: &Path) -> Result<String, Error> {
    let mut dirs = Vec::new();
    for dir_entry in fs::read_dir(dest)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_dir() {
            return Err(Error::MalformedArchive(format!(
                "unexpected top-level file {:?}",
                dir_entry.file_name()
            )));
        }
        dirs.push(dir_entry.file_name().to_string_lossy().into_owned());
    }
    match dirs.as_slice() {
        [single] => Ok(single.clone()),
        _ => Err(Error::MalformedArchive(format!(
            "expected exactly one top-level directory, found {}",
            dirs.len()
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    /// Build a tar+gz archive from (path, contents) pairs.
    pub(crate) fn build_archive(dest: &Path, members: &[(&str, &[u8])]) -> PathBuf {
        let archive_path = dest.join("fixture.tar.gz");
        let file = fs::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (path, contents) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            // Write the path directly into the header instead of going through
            // `append_data`/`set_path`, which reject `..` components: some of these
            // fixtures are deliberately malicious archives used to exercise the
            // extractor's own traversal checks.
            let name_bytes = path.as_bytes();
            header.as_gnu_mut().unwrap().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_cksum();
            builder.append(&header, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        archive_path
    }

    #[test]
    fn extracts_well_formed_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = build_archive(
            tmp.path(),
            &[
                ("rec-20251003T091500Z-3f9c4241/conversation.json", b"{}".as_slice()),
                (
                    "rec-20251003T091500Z-3f9c4241/checksums.sha256",
                    b"digest  conversation.json\n".as_slice(),
                ),
                (
                    "rec-20251003T091500Z-3f9c4241/media/clip.wav",
                    b"RIFF".as_slice(),
                ),
            ],
        );

        let out = tmp.path().join("out");
        fs::create_dir(&out).unwrap();
        let extracted = extract_archive(&archive, &out).unwrap();

        assert_eq!(extracted.top_dir, "rec-20251003T091500Z-3f9c4241");
        assert!(extracted.package_dir().join("conversation.json").is_file());
        assert!(extracted.package_dir().join("media/clip.wav").is_file());
        assert_eq!(extracted.uncompressed_bytes, 2 + 26 + 4);
    }

    #[test]
    fn rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = build_archive(
            tmp.path(),
            &[("rec-x/../../etc/passwd", b"root".as_slice())],
        );

        let out = tmp.path().join("out");
        fs::create_dir(&out).unwrap();
        let err = extract_archive(&archive, &out).unwrap_err();
        assert!(matches!(err, Error::MalformedArchive(_)), "{err}");
    }

    #[test]
    fn rejects_multiple_top_level_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = build_archive(
            tmp.path(),
            &[
                ("one/conversation.json", b"{}".as_slice()),
                ("two/conversation.json", b"{}".as_slice()),
            ],
        );

        let out = tmp.path().join("out");
        fs::create_dir(&out).unwrap();
        assert!(matches!(
            extract_archive(&archive, &out),
            Err(Error::MalformedArchive(_))
        ));
    }

    #[test]
    fn rejects_over_deep_nesting() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = build_archive(
            tmp.path(),
            &[("top/media/a/b/c.bin", b"x".as_slice())],
        );

        let out = tmp.path().join("out");
        fs::create_dir(&out).unwrap();
        assert!(matches!(
            extract_archive(&archive, &out),
            Err(Error::MalformedArchive(_))
        ));
    }
}
