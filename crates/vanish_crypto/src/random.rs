use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Fill `buf` from the OS CSPRNG, reporting an unusable source instead of panicking.
pub(crate) fn fill(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CryptoError::Environment(e.to_string()))
}
