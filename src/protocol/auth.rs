/// Password scrambles for the `mysql_native_password` and
/// `caching_sha2_password` authentication methods

use rand::Rng;
use sha1::{Digest, Sha1};
use sha2::Sha256;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const CACHING_SHA2_PLUGIN: &str = "caching_sha2_password";

/// Length of the challenge sent in the greeting
pub const SCRAMBLE_LEN: usize = 20;

/// Random printable challenge, avoiding NUL and '$' which some clients
/// treat specially
pub fn generate_salt() -> [u8; SCRAMBLE_LEN] {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SCRAMBLE_LEN];
    for byte in salt.iter_mut() {
        let mut b = rng.gen_range(0x21u8..0x7f);
        if b == b'$' {
            b += 1;
        }
        *byte = b;
    }
    salt
}

/// SHA1(password) XOR SHA1(salt ‖ SHA1(SHA1(password)))
///
/// An empty password yields an empty response.
pub fn scramble_native_password(salt: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) ‖ salt)
pub fn scramble_caching_sha2(salt: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(salt);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Scramble for the named plugin, `None` if the plugin is not supported
pub fn scramble_for_plugin(plugin: &str, salt: &[u8], password: &[u8]) -> Option<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD_PLUGIN | "" => Some(scramble_native_password(salt, password)),
        CACHING_SHA2_PLUGIN => Some(scramble_caching_sha2(salt, password)),
        _ => None,
    }
}

/// Check a client's native-password response against the configured password
pub fn verify_native_password(salt: &[u8], password: &[u8], response: &[u8]) -> bool {
    scramble_native_password(salt, password) == response
}
