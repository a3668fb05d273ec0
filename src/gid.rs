use crate::{Error, Result};

/// Maximum number of useful bytes a client-chosen GID may contain (199
/// useful bytes plus terminator).
pub const GID_MAX_LEN: usize = 199;

/// Size of the fixed-width GID field in the on-disk state file header:
/// `GID_MAX_LEN` bytes plus a NUL terminator.
pub const GID_FIELD_SIZE: usize = GID_MAX_LEN + 1;

/// An opaque, client-chosen, byte-wise-comparable identifier for a
/// prepared transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gid(Vec<u8>);

impl Gid {
    pub fn new<B: AsRef<[u8]>>(bytes: B) -> Result<Self> {
        let bytes = bytes.as_ref();
        if bytes.len() > GID_MAX_LEN {
            return Err(Error::InvalidParameter(format!(
                "GID exceeds maximum length of {} bytes",
                GID_MAX_LEN
            )));
        }
        Ok(Gid(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Serializes into the fixed-width, NUL-padded field stored in the
    /// state file header.
    pub fn to_field(&self) -> [u8; GID_FIELD_SIZE] {
        let mut field = [0u8; GID_FIELD_SIZE];
        field[..self.0.len()].copy_from_slice(&self.0);
        field
    }

    /// Reconstructs a `Gid` from a fixed-width field read back from disk.
    /// The bytes up to the first NUL are the payload; anything after it is
    /// ignored, matching a C-string field.
    pub fn from_field(field: &[u8; GID_FIELD_SIZE]) -> Self {
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        Gid(field[..len].to_vec())
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

impl<'a> From<&'a str> for Gid {
    fn from(s: &'a str) -> Self {
        // Only used by test/demo call sites that already know the GID is
        // within bounds; production call sites must use `Gid::new` and
        // handle the INVALID-PARAMETER error.
        Gid(s.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_boundary_length() {
        let gid = Gid::new(vec![b'x'; GID_MAX_LEN]).unwrap();
        assert_eq!(gid.as_bytes().len(), GID_MAX_LEN);
    }

    #[test]
    fn rejects_over_length() {
        let err = Gid::new(vec![b'x'; GID_MAX_LEN + 1]).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn field_roundtrip() {
        let gid = Gid::new("tx-a").unwrap();
        let field = gid.to_field();
        let back = Gid::from_field(&field);
        assert_eq!(gid, back);
    }
}
