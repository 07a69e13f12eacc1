//! Hex rendering for digests in log lines.

use core::fmt;

/// Lowercase hex view of a byte slice. `{:#}` prints only the first
/// [`SHORT_LEN`] bytes, which is plenty to tell grids apart in a log.
pub struct HexSlice<'a>(&'a [u8]);

pub const SHORT_LEN: usize = 6;

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = if f.alternate() {
            &self.0[..self.0.len().min(SHORT_LEN)]
        } else {
            self.0
        };
        for byte in bytes {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice(self.as_ref())
    }
}
