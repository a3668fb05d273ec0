/// Internal monotonic transaction identifier. 32 bits, matching the
/// width implied by the state-file naming convention (8 hex digits).
pub type XID = u32;

#[inline(always)]
pub fn is_invalid_xid(xid: XID) -> bool {
    xid == 0
}

#[inline(always)]
pub fn xid_inc(xid: XID) -> XID {
    xid.wrapping_add(1)
}

#[inline(always)]
pub fn xid_dec(xid: XID) -> XID {
    xid.wrapping_sub(1)
}

/// Renders the filename a prepared transaction's state file is stored
/// under: 8 uppercase hex digits, zero padded.
pub fn xid_to_filename(xid: XID) -> String {
    format!("{:08X}", xid)
}

pub fn filename_to_xid(name: &str) -> Option<XID> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_roundtrip() {
        for xid in [0u32, 1, 1000, 0xDEAD_BEEF, u32::MAX] {
            let name = xid_to_filename(xid);
            assert_eq!(name.len(), 8);
            assert_eq!(filename_to_xid(&name), Some(xid));
        }
    }

    #[test]
    fn rejects_malformed_filenames() {
        assert_eq!(filename_to_xid("DEADBEEF"), Some(0xDEAD_BEEF));
        assert_eq!(filename_to_xid("deadbeef"), Some(0xDEAD_BEEF));
        assert_eq!(filename_to_xid("1234"), None);
        assert_eq!(filename_to_xid("GGGGGGGG"), None);
    }
}
