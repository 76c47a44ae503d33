//! Filesystem Staging
//!
//! Transfers never touch their destination path while in flight. A read
//! request serves a private snapshot of the source file; a write request
//! accumulates into a temporary that is renamed onto the destination only
//! once the final block has been written. Either way the temporary is the
//! session's to delete on any exit path.
//!
//! Temporary names are `tftp.NNNNN` in the OS temp directory, where `NNNNN`
//! is a zero-padded 16-bit counter shared by the whole process.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;

use crate::protocol::TftpError;

/// Prefix of every staging file name.
pub const TMP_PREFIX: &str = "tftp.";

const DEFAULT_MAIL_DIR: &str = "/var/spool/mail";

static TMP_COUNT: AtomicU16 = AtomicU16::new(0);
static MAIL_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Override the mail directory before the first mail transfer.
///
/// Called by the binary when `--mail-prefix` is given; has no effect once
/// [`mail_directory`] has resolved.
pub fn set_mail_prefix(path: PathBuf) {
    let _ = MAIL_DIR.set(path);
}

/// The directory mail-mode uploads land in.
///
/// Resolved once per process: an explicit [`set_mail_prefix`] wins, then the
/// `TFTP_MAIL_PREFIX` environment variable, then `/var/spool/mail`.
pub fn mail_directory() -> &'static Path {
    MAIL_DIR
        .get_or_init(|| {
            env::var_os("TFTP_MAIL_PREFIX")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MAIL_DIR))
        })
        .as_path()
}

/// Allocate the next staging file name.
fn tmpname() -> PathBuf {
    let count = TMP_COUNT.fetch_add(1, Ordering::Relaxed);
    env::temp_dir().join(format!("{TMP_PREFIX}{count:05}"))
}

/// A staging file together with its open handle.
#[derive(Debug)]
pub struct Staged {
    /// Path of the temporary on disk.
    pub tmp: PathBuf,
    /// Open handle (read side for RRQ, write side for WRQ).
    pub file: File,
}

/// Snapshot `source` into a fresh temporary and open the copy for reading.
pub fn stage_for_read(source: &Path) -> Result<Staged, TftpError> {
    let tmp = tmpname();
    if let Err(err) = fs::copy(source, &tmp) {
        return Err(if err.kind() == io::ErrorKind::NotFound {
            TftpError::FileNotFound
        } else {
            TftpError::AccessViolation
        });
    }

    match File::open(&tmp) {
        Ok(file) => Ok(Staged { tmp, file }),
        Err(_) => {
            let _ = fs::remove_file(&tmp);
            Err(TftpError::AccessViolation)
        }
    }
}

/// Open a fresh truncated temporary for writing toward `target`.
///
/// The target is touched first so that an uncreatable destination fails the
/// request up front instead of at commit time. A missing parent directory
/// surfaces as [`TftpError::FileNotFound`]; the engine rewrites that to
/// "No such user" for mail transfers.
pub fn stage_for_write(target: &Path) -> Result<Staged, TftpError> {
    if let Err(err) = touch(target) {
        return Err(if err.kind() == io::ErrorKind::NotFound {
            TftpError::FileNotFound
        } else {
            TftpError::AccessViolation
        });
    }

    let tmp = tmpname();
    match File::create(&tmp) {
        Ok(file) => Ok(Staged { tmp, file }),
        Err(_) => Err(TftpError::AccessViolation),
    }
}

/// Create `path` if it does not exist, leaving existing content alone.
fn touch(path: &Path) -> io::Result<()> {
    OpenOptions::new().append(true).create(true).open(path).map(|_| ())
}

/// Atomically rename the finished temporary onto its destination.
pub fn commit(tmp: &Path, target: &Path) -> Result<(), TftpError> {
    fs::rename(tmp, target).map_err(|_| TftpError::AccessViolation)
}

/// Best-effort removal of a staging file; a missing file is not an error.
pub fn discard(tmp: &Path) {
    if !tmp.as_os_str().is_empty() {
        let _ = fs::remove_file(tmp);
    }
}
