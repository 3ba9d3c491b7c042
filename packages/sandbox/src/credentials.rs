// ABOUTME: Identity and credential generation for new sandboxes
// ABOUTME: Draws sandbox ids, login names and secrets from the operating system CSPRNG

use rand::rngs::OsRng;
use rand::Rng;
use std::fmt;

/// Alphabet for sandbox ids (lowercase alphanumeric, hostname-safe)
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Alphabet for login and root secrets (mixed-case alphanumeric)
const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of a sandbox id. 36^8 ids keeps collisions negligible below ~10^5 sandboxes.
pub const SANDBOX_ID_LEN: usize = 8;

/// Length of generated login and root secrets
pub const SECRET_LEN: usize = 12;

/// Prefix for generated login names
const LOGIN_USER_PREFIX: &str = "user";

/// Freshly generated identity for one sandbox.
///
/// `login_secret` and `root_secret` are live credentials; `Debug` redacts them.
#[derive(Clone, PartialEq, Eq)]
pub struct SandboxIdentity {
    pub sandbox_id: String,
    pub login_user: String,
    pub login_secret: String,
    pub root_secret: String,
}

impl SandboxIdentity {
    /// Generate a new identity. Pure apart from consuming randomness.
    pub fn generate() -> Self {
        Self {
            sandbox_id: generate_sandbox_id(),
            login_user: generate_login_user(),
            login_secret: generate_secret(),
            root_secret: generate_secret(),
        }
    }
}

impl fmt::Debug for SandboxIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxIdentity")
            .field("sandbox_id", &self.sandbox_id)
            .field("login_user", &self.login_user)
            .field("login_secret", &"<redacted>")
            .field("root_secret", &"<redacted>")
            .finish()
    }
}

/// Where the provisioning engine draws new identities from
pub trait IdentitySource: Send + Sync {
    fn next_identity(&self) -> SandboxIdentity;
}

/// Identities drawn from the OS CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdentities;

impl IdentitySource for RandomIdentities {
    fn next_identity(&self) -> SandboxIdentity {
        SandboxIdentity::generate()
    }
}

/// Random sandbox id, e.g. `k3v9q0za`
pub fn generate_sandbox_id() -> String {
    random_string(ID_ALPHABET, SANDBOX_ID_LEN)
}

/// Login name with a random four digit suffix, e.g. `user4821`
pub fn generate_login_user() -> String {
    let suffix: u16 = OsRng.gen_range(1000..=9999);
    format!("{}{}", LOGIN_USER_PREFIX, suffix)
}

/// Random secret suitable for interactive password login
pub fn generate_secret() -> String {
    random_string(SECRET_ALPHABET, SECRET_LEN)
}

fn random_string(alphabet: &[u8], len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}
