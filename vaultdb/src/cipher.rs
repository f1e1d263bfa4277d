//! Encrypted-database configuration.
//!
//! The keying pragma must be the very first statement on a fresh
//! connection; everything else (compatibility profile, caller setup,
//! verification) happens after it. Keying is lazy in the engine: a wrong
//! key does not fail the open itself, it fails the first page read, which
//! is why [`open_encrypted`] always ends with a verification read.
//!
//! Key material is wrapped in [`secrecy`]/[`zeroize`] types and the
//! marshalled key-bearing SQL is wiped after execution.

use std::fmt;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::connection::{Connection, OpenFlags, SetupAction};
use crate::error::{Error, Result};
use crate::ffi;
use crate::value::Value;

// ── Keys ────────────────────────────────────────────────────────────────

/// A database key.
///
/// A passphrase is stretched through the engine's KDF; a raw key is used
/// directly (hex literal form), bypassing derivation.
pub enum Key {
    /// UTF-8 passphrase, derived via the profile's KDF.
    Passphrase(SecretString),
    /// Raw 256-bit key, used as-is.
    Raw(Zeroizing<[u8; 32]>),
}

impl Key {
    /// A passphrase key.
    pub fn passphrase(secret: &str) -> Self {
        Self::Passphrase(SecretString::from(secret.to_string()))
    }

    /// A raw 256-bit key.
    pub fn raw(bytes: [u8; 32]) -> Self {
        Self::Raw(Zeroizing::new(bytes))
    }

    /// The key as an SQL literal: quoted text for passphrases, a hex blob
    /// literal for raw keys.
    fn literal(&self) -> Zeroizing<String> {
        match self {
            Self::Passphrase(secret) => Zeroizing::new(format!(
                "'{}'",
                secret.expose_secret().replace('\'', "''")
            )),
            Self::Raw(bytes) => Zeroizing::new(format!("x'{}'", hex::encode(bytes.as_ref()))),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("Key::Passphrase(..)"),
            Self::Raw(_) => f.write_str("Key::Raw(..)"),
        }
    }
}

// ── Cipher parameters ───────────────────────────────────────────────────

/// Hash used for per-page HMAC integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlg {
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl HmacAlg {
    const fn pragma_value(self) -> &'static str {
        match self {
            Self::Sha1 => "HMAC_SHA1",
            Self::Sha256 => "HMAC_SHA256",
            Self::Sha512 => "HMAC_SHA512",
        }
    }
}

/// Hash used inside the key derivation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfAlg {
    /// PBKDF2 over SHA-1.
    Sha1,
    /// PBKDF2 over SHA-256.
    Sha256,
    /// PBKDF2 over SHA-512.
    Sha512,
}

impl KdfAlg {
    const fn pragma_value(self) -> &'static str {
        match self {
            Self::Sha1 => "PBKDF2_HMAC_SHA1",
            Self::Sha256 => "PBKDF2_HMAC_SHA256",
            Self::Sha512 => "PBKDF2_HMAC_SHA512",
        }
    }
}

/// The six parameters that distinguish encrypted-file generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    /// KDF iteration count.
    pub kdf_iter: u32,
    /// Page size in bytes.
    pub page_size: u32,
    /// Whether pages carry an integrity HMAC.
    pub use_hmac: bool,
    /// Bytes at the start of the file left unencrypted.
    pub plaintext_header_size: u32,
    /// Hash for the page HMAC.
    pub hmac_algorithm: HmacAlg,
    /// Hash inside the KDF.
    pub kdf_algorithm: KdfAlg,
}

/// An encrypted-file generation.
///
/// The four named profiles reproduce the engine's four historical file
/// formats; `Custom` spells all six parameters out explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherProfile {
    /// First generation: 4,000 KDF iterations, 1 KiB pages, no HMAC.
    V1,
    /// Second generation: adds the per-page HMAC.
    V2,
    /// Third generation: 64,000 KDF iterations.
    V3,
    /// Fourth generation: 256,000 iterations, 4 KiB pages, SHA-512.
    V4,
    /// Explicit parameter set.
    Custom(CipherParams),
}

impl CipherProfile {
    /// The parameter set a named profile expands to.
    pub const fn params(self) -> CipherParams {
        match self {
            Self::V1 => CipherParams {
                kdf_iter: 4000,
                page_size: 1024,
                use_hmac: false,
                plaintext_header_size: 0,
                hmac_algorithm: HmacAlg::Sha1,
                kdf_algorithm: KdfAlg::Sha1,
            },
            Self::V2 => CipherParams {
                kdf_iter: 4000,
                page_size: 1024,
                use_hmac: true,
                plaintext_header_size: 0,
                hmac_algorithm: HmacAlg::Sha1,
                kdf_algorithm: KdfAlg::Sha1,
            },
            Self::V3 => CipherParams {
                kdf_iter: 64_000,
                page_size: 1024,
                use_hmac: true,
                plaintext_header_size: 0,
                hmac_algorithm: HmacAlg::Sha1,
                kdf_algorithm: KdfAlg::Sha1,
            },
            Self::V4 => CipherParams {
                kdf_iter: 256_000,
                page_size: 4096,
                use_hmac: true,
                plaintext_header_size: 0,
                hmac_algorithm: HmacAlg::Sha512,
                kdf_algorithm: KdfAlg::Sha512,
            },
            Self::Custom(params) => params,
        }
    }

    /// The pragma script configuring this profile on a keyed connection.
    fn pragmas(self) -> String {
        match self {
            Self::V1 => "PRAGMA cipher_compatibility = 1;".to_string(),
            Self::V2 => "PRAGMA cipher_compatibility = 2;".to_string(),
            Self::V3 => "PRAGMA cipher_compatibility = 3;".to_string(),
            Self::V4 => "PRAGMA cipher_compatibility = 4;".to_string(),
            Self::Custom(params) => format!(
                "PRAGMA kdf_iter = {};\
                 PRAGMA cipher_page_size = {};\
                 PRAGMA cipher_use_hmac = {};\
                 PRAGMA cipher_plaintext_header_size = {};\
                 PRAGMA cipher_hmac_algorithm = {};\
                 PRAGMA cipher_kdf_algorithm = {};",
                params.kdf_iter,
                params.page_size,
                if params.use_hmac { "ON" } else { "OFF" },
                params.plaintext_header_size,
                params.hmac_algorithm.pragma_value(),
                params.kdf_algorithm.pragma_value(),
            ),
        }
    }
}

impl Default for CipherProfile {
    fn default() -> Self {
        Self::V4
    }
}

// ── Operations ──────────────────────────────────────────────────────────

/// Opens a keyed database.
///
/// The key pragma runs before any other statement, then the profile's
/// pragmas, then `setup`, then the schema verification read. A wrong key
/// surfaces here as [`Error::Open`] wrapping the engine's
/// corruption/format message, because the engine only touches pages at
/// the verification read.
pub fn open_encrypted(
    path: &Path,
    key: &Key,
    profile: CipherProfile,
    flags: OpenFlags,
    setup: &[SetupAction],
) -> Result<Connection> {
    let conn = Connection::open_raw(path, flags)?;
    apply_key(&conn, "key", key)
        .and_then(|()| conn.execute_batch(&profile.pragmas()))
        .and_then(|()| conn.apply_setup(setup))
        .and_then(|()| conn.verify())
        .map_err(|err| Error::Open(err.to_string()))?;
    Ok(conn)
}

/// Re-encrypts an open keyed database in place under `new_key`.
pub fn rekey(conn: &Connection, new_key: &Key) -> Result<()> {
    apply_key(conn, "rekey", new_key)
}

/// Reads the cipher layer's version string.
///
/// Errors if the linked engine has no cipher layer at all.
pub fn cipher_version(conn: &Connection) -> Result<String> {
    let row = conn
        .query_row_optional("PRAGMA cipher_version", &[])?
        .ok_or(Error::Other {
            code: ffi::SQLITE_ERROR,
            message: "engine has no cipher layer".to_string(),
        })?;
    row.value(0)
        .and_then(Value::text_value)
        .ok_or(Error::Other {
            code: ffi::SQLITE_ERROR,
            message: "engine has no cipher layer".to_string(),
        })
}

fn apply_key(conn: &Connection, pragma: &str, key: &Key) -> Result<()> {
    let sql = Zeroizing::new(format!("PRAGMA {pragma} = {};", key.literal().as_str()));
    conn.execute_batch_zeroized(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("vault.db")
    }

    fn seed(conn: &Connection) {
        conn.execute_batch("CREATE TABLE notes (body TEXT)").expect("create");
        conn.execute_params("INSERT INTO notes VALUES ('classified')", &[])
            .expect("insert");
    }

    #[test]
    fn wrong_key_fails_at_first_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        {
            let conn = open_encrypted(
                &path,
                &Key::passphrase("secret"),
                CipherProfile::default(),
                OpenFlags::default(),
                &[],
            )
            .expect("open new");
            seed(&conn);
        }
        let wrong = open_encrypted(
            &path,
            &Key::passphrase("wrong"),
            CipherProfile::default(),
            OpenFlags::default(),
            &[],
        );
        assert!(matches!(wrong, Err(Error::Open(_))));
        let conn = open_encrypted(
            &path,
            &Key::passphrase("secret"),
            CipherProfile::default(),
            OpenFlags::default(),
            &[],
        )
        .expect("reopen");
        let row = conn.query_row("SELECT body FROM notes", &[]).expect("read");
        assert_eq!(row.value(0), Some(&Value::Text("classified".to_string())));
    }

    #[test]
    fn named_profile_matches_explicit_parameters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        {
            let conn = open_encrypted(
                &path,
                &Key::passphrase("secret"),
                CipherProfile::V3,
                OpenFlags::default(),
                &[],
            )
            .expect("open v3");
            seed(&conn);
        }
        let conn = open_encrypted(
            &path,
            &Key::passphrase("secret"),
            CipherProfile::Custom(CipherProfile::V3.params()),
            OpenFlags::default(),
            &[],
        )
        .expect("open explicit");
        let row = conn
            .query_row("SELECT count(*) FROM notes", &[])
            .expect("read");
        assert_eq!(row.value(0), Some(&Value::Integer(1)));
    }

    #[test]
    fn rekey_reencrypts_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        {
            let conn = open_encrypted(
                &path,
                &Key::passphrase("old"),
                CipherProfile::default(),
                OpenFlags::default(),
                &[],
            )
            .expect("open");
            seed(&conn);
            rekey(&conn, &Key::passphrase("new")).expect("rekey");
        }
        assert!(open_encrypted(
            &path,
            &Key::passphrase("old"),
            CipherProfile::default(),
            OpenFlags::default(),
            &[],
        )
        .is_err());
        let conn = open_encrypted(
            &path,
            &Key::passphrase("new"),
            CipherProfile::default(),
            OpenFlags::default(),
            &[],
        )
        .expect("reopen");
        let row = conn.query_row("SELECT count(*) FROM notes", &[]).expect("read");
        assert_eq!(row.value(0), Some(&Value::Integer(1)));
    }

    #[test]
    fn raw_key_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        let key_bytes = [7_u8; 32];
        {
            let conn = open_encrypted(
                &path,
                &Key::raw(key_bytes),
                CipherProfile::default(),
                OpenFlags::default(),
                &[],
            )
            .expect("open");
            seed(&conn);
        }
        let conn = open_encrypted(
            &path,
            &Key::raw(key_bytes),
            CipherProfile::default(),
            OpenFlags::default(),
            &[],
        )
        .expect("reopen");
        let row = conn.query_row("SELECT body FROM notes", &[]).expect("read");
        assert_eq!(row.value(0), Some(&Value::Text("classified".to_string())));
    }

    #[test]
    fn cipher_layer_reports_version() {
        let conn = Connection::open_in_memory().expect("open");
        let version = cipher_version(&conn).expect("version");
        assert!(!version.is_empty());
    }
}
