//! The page transform pipeline.
//!
//! Every page crossing the substrate boundary passes through a transform:
//! plaintext on the engine side, transformed bytes on the source side.
//! Transforms must be size-invariant on the page boundary; designs that
//! need extra room (authentication tags, compression headers) put it in
//! the reserved-bytes region at the end of each page.

use crate::vfs::PageNum;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Page {0} failed the read transform: {1}")]
    ReadFailed(PageNum, String),
    #[error("Page {0} failed the write transform: {1}")]
    WriteFailed(PageNum, String),
}

/// A pair of pure per-page functions applied below the cache and above the
/// source.  `src` and `dst` are always exactly one page long.
pub trait PageTransform {
    /// Source bytes to engine bytes.
    fn transform_read(&self, src: &[u8], dst: &mut [u8], pn: PageNum) -> Result<(), Error>;

    /// Engine bytes to source bytes.
    fn transform_write(&self, src: &[u8], dst: &mut [u8], pn: PageNum) -> Result<(), Error>;
}

/// The mandatory do-nothing transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl PageTransform for IdentityTransform {
    fn transform_read(&self, src: &[u8], dst: &mut [u8], _pn: PageNum) -> Result<(), Error> {
        dst.copy_from_slice(src);
        Ok(())
    }

    fn transform_write(&self, src: &[u8], dst: &mut [u8], _pn: PageNum) -> Result<(), Error> {
        dst.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A toy size-invariant transform: XOR every byte past the header
    // region with a key derived from the page number.
    struct XorTransform;

    impl XorTransform {
        fn key(pn: PageNum) -> u8 {
            (pn as u8).wrapping_mul(37) | 1
        }
    }

    impl PageTransform for XorTransform {
        fn transform_read(&self, src: &[u8], dst: &mut [u8], pn: PageNum) -> Result<(), Error> {
            let key = Self::key(pn);
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s ^ key;
            }
            Ok(())
        }

        fn transform_write(&self, src: &[u8], dst: &mut [u8], pn: PageNum) -> Result<(), Error> {
            self.transform_read(src, dst, pn)
        }
    }

    #[test]
    fn test_identity_round_trip() {
        let page = (0..=255).cycle().take(512).collect::<Vec<u8>>();
        let mut transformed = vec![0_u8; 512];
        let mut back = vec![0_u8; 512];
        IdentityTransform
            .transform_write(&page, &mut transformed, 3)
            .unwrap();
        assert_eq!(transformed, page);
        IdentityTransform
            .transform_read(&transformed, &mut back, 3)
            .unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn test_xor_round_trip_differs_on_disk() {
        let page = vec![0xaa_u8; 512];
        let mut transformed = vec![0_u8; 512];
        let mut back = vec![0_u8; 512];
        XorTransform.transform_write(&page, &mut transformed, 7).unwrap();
        assert_ne!(transformed, page);
        XorTransform.transform_read(&transformed, &mut back, 7).unwrap();
        assert_eq!(back, page);
    }
}
