//! Digests of local files, computed for the files-digest operation.
use crate::definitions::digest::{self, DigestAlgorithm};
use crate::definitions::messages::FileDigest;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const BLOCK_SIZE: usize = 10 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    UnsupportedDigest(#[from] digest::Error),
    #[error("unable to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Total number of blocks `files` will be read in, used as the progress maximum.
pub fn block_count(files: &[PathBuf]) -> Result<u64, Error> {
    files.iter().try_fold(0u64, |total, path| {
        let len = std::fs::metadata(path)
            .map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?
            .len();
        Ok(total + len.div_ceil(BLOCK_SIZE as u64).max(1))
    })
}

/// Hash one file, calling `on_block` after every block read.
pub fn digest_file(
    path: &Path,
    algorithm: DigestAlgorithm,
    mut on_block: impl FnMut(),
) -> Result<Vec<u8>, Error> {
    let io_error = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_error)?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(io_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        on_block();
    }
    Ok(hasher.finalize().into_vec())
}

/// Hash every file with the named algorithm.
///
/// Accepted names are `SHA1`, `SHA-1`, `SHA-256`, `SHA-384` and `SHA-512`.
pub fn digest_files(
    files: &[PathBuf],
    algorithm_name: &str,
    mut on_block: impl FnMut(),
) -> Result<Vec<FileDigest>, Error> {
    let algorithm = DigestAlgorithm::parse_files_digest(algorithm_name)?;
    files
        .iter()
        .map(|path| {
            let digest = digest_file(path, algorithm, &mut on_block)?;
            tracing::debug!("{} digest of {}", algorithm, path.display());
            Ok::<_, Error>(FileDigest {
                digest_algorithm: algorithm_name.to_string(),
                digest: hex::encode_upper(digest),
                file_name: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[test]
    fn digests_files_in_upper_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "abc.txt", b"abc");
        let mut blocks = 0;
        let digests = digest_files(&[path], "SHA-256", || blocks += 1).unwrap();
        assert_eq!(
            digests,
            vec![FileDigest {
                digest_algorithm: "SHA-256".into(),
                digest: "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".into(),
                file_name: "abc.txt".into(),
            }]
        );
        assert_eq!(blocks, 1);
    }

    #[test]
    fn large_files_are_read_in_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![0x42u8; BLOCK_SIZE * 2 + 1];
        let path = write(&dir, "big.bin", &content);
        let mut blocks = 0;
        let digests = digest_files(&[path.clone()], "SHA1", || blocks += 1).unwrap();
        assert_eq!(blocks, 3);
        assert_eq!(block_count(&[path]).unwrap(), 3);
        assert_eq!(
            digests[0].digest,
            hex::encode_upper(DigestAlgorithm::Sha1.digest(&content))
        );
    }

    #[test]
    fn md5_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", b"a");
        assert!(matches!(
            digest_files(&[path], "MD5", || {}),
            Err(Error::UnsupportedDigest(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        assert!(matches!(
            digest_files(&[missing], "SHA-512", || {}),
            Err(Error::Io { .. })
        ));
    }
}
