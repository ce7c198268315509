// Platform Sync Engine — key material provider (§6).
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use sha1::{Digest, Sha1};

use platform_wire::SHA1_LEN;

/// External collaborator supplying the endpoint's public key material and
/// the SHA-1 primitive used to digest it (§6). Hosts on constrained
/// hardware may override `compute_sha1` with an accelerator; the default
/// falls back to a software implementation.
pub trait KeyProvider: Send + Sync {
    /// Returns the endpoint's public key blob. Ownership of the returned
    /// bytes belongs to the caller, unlike the C SDK's
    /// `caller_owns`-tagged borrow.
    fn endpoint_public_key(&self) -> Vec<u8>;

    fn compute_sha1(&self, data: &[u8]) -> [u8; SHA1_LEN] {
        sha1(data)
    }
}

/// Stand-alone SHA-1, used by extensions that need to hash locally-owned
/// data (profile bodies, configuration bodies) without routing through the
/// key provider.
pub fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; SHA1_LEN];
    out.copy_from_slice(&digest);
    out
}

/// A `KeyProvider` holding a fixed key, useful for tests and for hosts that
/// provision the endpoint key out of band.
pub struct StaticKeyProvider {
    public_key: Vec<u8>,
}

impl StaticKeyProvider {
    pub fn new(public_key: Vec<u8>) -> Self {
        StaticKeyProvider { public_key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn endpoint_public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }
}
