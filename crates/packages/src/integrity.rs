use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::Error;

const MANIFEST_NAME: &str = "checksums.sha256";
const CONVERSATION_NAME: &str = "conversation.json";

/// Streaming SHA-256 of a file, 1 MiB at a time, as lowercase hex.
pub fn file_sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare two lowercase hex digests without early exit. Both inputs are
/// locally computed or already format-validated, so equal length is the
/// common case and unequal length is itself a mismatch.
fn digests_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Level 2: the downloaded archive must hash to the envelope digest.
pub fn verify_archive_checksum(archive: &Path, expected_hex: &str) -> Result<(), Error> {
    let actual = file_sha256_hex(archive)?;
    if !digests_match(&actual, expected_hex) {
        return Err(Error::ArchiveChecksumMismatch {
            expected: expected_hex.to_string(),
            actual,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest_hex: String,
    pub rel_path: String,
}

/// Parse `checksums.sha256`: one `<hex>  <relative-path>` line per file.
pub fn parse_manifest(content: &str) -> Result<Vec<ManifestEntry>, Error> {
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let malformed = || Error::MalformedManifestLine {
            line: index + 1,
            content: line.to_string(),
        };

        let (digest_hex, rel_path) = line.split_once("  ").ok_or_else(malformed)?;
        if digest_hex.len() != 64
            || !digest_hex
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(malformed());
        }
        if rel_path.is_empty() || rel_path.starts_with('/') || rel_path.contains("..") {
            return Err(malformed());
        }
        entries.push(ManifestEntry {
            digest_hex: digest_hex.to_string(),
            rel_path: rel_path.to_string(),
        });
    }
    Ok(entries)
}

/// Level 3: every file inside the package must be listed in the manifest
/// with a matching digest; listed-but-missing and present-but-unlisted
/// files are both violations, and `conversation.json` must be covered.
///
/// The manifest cannot carry its own final digest, so its entry (when
/// present) asserts coverage and is skipped during recomputation.
/// Whether self-listing is mandatory is deployment policy.
pub fn verify_manifest(package_dir: &Path, require_self_listing: bool) -> Result<(), Error> {
    let manifest_path = package_dir.join(MANIFEST_NAME);
    if !manifest_path.is_file() {
        return Err(Error::ManifestViolation(format!(
            "{MANIFEST_NAME} is missing from the package"
        )));
    }
    let entries = parse_manifest(&fs::read_to_string(&manifest_path)?)?;

    let mut listed = std::collections::BTreeSet::new();
    let mut covers_conversation = false;
    let mut covers_self = false;

    for entry in &entries {
        if !listed.insert(entry.rel_path.clone()) {
            return Err(Error::ManifestViolation(format!(
                "{} is listed twice",
                entry.rel_path
            )));
        }
        if entry.rel_path == CONVERSATION_NAME {
            covers_conversation = true;
        }
        if entry.rel_path == MANIFEST_NAME {
            covers_self = true;
            continue; // Self-skip.
        }

        let path = package_dir.join(&entry.rel_path);
        if !path.is_file() {
            return Err(Error::ManifestViolation(format!(
                "{} is listed but missing from the package",
                entry.rel_path
            )));
        }
        let actual = file_sha256_hex(&path)?;
        if !digests_match(&actual, &entry.digest_hex) {
            return Err(Error::ManifestViolation(format!(
                "{} digest {} does not match manifest digest {}",
                entry.rel_path, actual, entry.digest_hex
            )));
        }
    }

    if !covers_conversation {
        return Err(Error::ManifestViolation(format!(
            "manifest does not cover {CONVERSATION_NAME}"
        )));
    }
    if require_self_listing && !covers_self {
        return Err(Error::ManifestViolation(format!(
            "manifest does not list itself ({MANIFEST_NAME})"
        )));
    }

    // Unlisted files invalidate the chain just as mismatches do.
    for file in walk_files(package_dir)? {
        let rel = file
            .strip_prefix(package_dir)
            .expect("walked file is under package_dir")
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if rel != MANIFEST_NAME && !listed.contains(&rel) {
            return Err(Error::ManifestViolation(format!(
                "{rel} is present but not listed in the manifest"
            )));
        }
    }

    Ok(())
}

fn walk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let kind = entry.file_type()?;
            if kind.is_dir() {
                stack.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn digest_of(contents: &[u8]) -> String {
        hex::encode(Sha256::digest(contents))
    }

    /// Lay out a package directory with a manifest covering `files`.
    fn package(tmp: &Path, files: &[(&str, &[u8])], list_self: bool) -> PathBuf {
        let dir = tmp.join("rec-20251003T091500Z-3f9c4241");
        fs::create_dir_all(&dir).unwrap();

        let mut manifest = String::new();
        for (name, contents) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::File::create(&path)
                .unwrap()
                .write_all(contents)
                .unwrap();
            manifest.push_str(&format!("{}  {}\n", digest_of(contents), name));
        }
        if list_self {
            manifest.push_str(&format!("{}  {}\n", "0".repeat(64), MANIFEST_NAME));
        }
        fs::write(dir.join(MANIFEST_NAME), manifest).unwrap();
        dir
    }

    #[test]
    fn archive_digest_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("archive.bin");
        fs::write(&path, b"package bytes").unwrap();

        let digest = file_sha256_hex(&path).unwrap();
        verify_archive_checksum(&path, &digest).unwrap();

        let err = verify_archive_checksum(&path, &"0".repeat(64)).unwrap_err();
        assert!(matches!(err, Error::ArchiveChecksumMismatch { .. }));
        assert_eq!(err.code(), models::ErrorCode::ChecksumMismatch);
    }

    #[test]
    fn manifest_happy_path_with_self_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = package(
            tmp.path(),
            &[
                ("conversation.json", br#"{"ok":true}"#.as_slice()),
                ("media/clip.wav", b"RIFF".as_slice()),
            ],
            true,
        );
        verify_manifest(&dir, true).unwrap();
    }

    #[test]
    fn manifest_self_listing_is_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = package(
            tmp.path(),
            &[("conversation.json", b"{}".as_slice())],
            false,
        );

        // Tolerated when the deployment says so, required by default.
        verify_manifest(&dir, false).unwrap();
        let err = verify_manifest(&dir, true).unwrap_err();
        assert!(err.to_string().contains("does not list itself"), "{err}");
    }

    #[test]
    fn manifest_must_cover_conversation_json() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = package(tmp.path(), &[("media/clip.wav", b"RIFF".as_slice())], true);
        // conversation.json exists on disk but is not listed.
        fs::write(dir.join("conversation.json"), b"{}").unwrap();

        let err = verify_manifest(&dir, true).unwrap_err();
        assert!(err.to_string().contains("does not cover"), "{err}");
    }

    #[test]
    fn manifest_detects_mismatch_missing_and_extra_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = package(
            tmp.path(),
            &[
                ("conversation.json", b"{}".as_slice()),
                ("media/clip.wav", b"RIFF".as_slice()),
            ],
            true,
        );

        // Corrupted member.
        fs::write(dir.join("media/clip.wav"), b"RIFX").unwrap();
        let err = verify_manifest(&dir, true).unwrap_err();
        assert!(err.to_string().contains("does not match"), "{err}");

        // Listed but missing.
        fs::remove_file(dir.join("media/clip.wav")).unwrap();
        let err = verify_manifest(&dir, true).unwrap_err();
        assert!(err.to_string().contains("missing from the package"), "{err}");

        // Restore, then add an unlisted straggler.
        fs::write(dir.join("media/clip.wav"), b"RIFF").unwrap();
        fs::write(dir.join("media/extra.bin"), b"??").unwrap();
        let err = verify_manifest(&dir, true).unwrap_err();
        assert!(err.to_string().contains("not listed"), "{err}");
    }

    #[test]
    fn manifest_rejects_malformed_lines() {
        for line in [
            "tooshort  conversation.json",
            "ZZ  conversation.json",
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef conversation.json",
            &format!("{}  /etc/passwd", "a".repeat(64)),
            &format!("{}  ../escape", "a".repeat(64)),
        ] {
            assert!(parse_manifest(line).is_err(), "{line}");
        }

        let ok = format!("{}  conversation.json", "a".repeat(64));
        assert_eq!(parse_manifest(&ok).unwrap().len(), 1);
    }
}
