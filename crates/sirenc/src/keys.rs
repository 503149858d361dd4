use siren_common::crypto;
use siren_common::types::Pubkey;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

const KEY_FILE_PERMS: u32 = 0o600;

/// Loads the client's Curve25519 keypair from `path`, generating and
/// persisting a fresh one if the file does not exist. The public key is
/// mirrored to `<path>.pub`.
///
/// # Errors
///
/// Returns an error if the key file has wrong permissions, wrong length,
/// or if file I/O fails.
pub fn load_or_generate_keypair(path: &Path) -> anyhow::Result<(Pubkey, [u8; 32])> {
    if path.exists() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::metadata(path)?.permissions().mode();
            if permissions & 0o077 != 0 {
                anyhow::bail!(
                    "key file {} has overly permissive permissions ({:o}), must be 0600",
                    path.display(),
                    permissions & 0o777
                );
            }
        }

        let secret = fs::read(path)?;
        if secret.len() != 32 {
            anyhow::bail!(
                "key file must contain exactly 32 bytes, got {}",
                secret.len()
            );
        }

        let mut secret_key = [0u8; 32];
        secret_key.copy_from_slice(&secret);
        let public_key = crypto::public_key_of(&secret_key);

        let pub_path = path.with_extension("pub");
        if !pub_path.exists() {
            fs::write(&pub_path, public_key)?;
        }

        Ok((public_key, secret_key))
    } else {
        let (public_key, secret_key) = crypto::generate_keypair();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(KEY_FILE_PERMS);
        }
        let mut file = options.open(path)?;
        file.write_all(&secret_key)?;
        drop(file);

        fs::write(path.with_extension("pub"), public_key)?;

        Ok((public_key, secret_key))
    }
}
