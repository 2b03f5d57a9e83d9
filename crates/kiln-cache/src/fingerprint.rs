use sha2::{Digest, Sha256};
use std::fmt;

/// Rotation applied to the accumulator before each fold step. Any value that is
/// not a multiple of 128 keeps the fold order sensitive.
const FOLD_ROTATION: u32 = 13;

/// One input source buffer of a cache request.
///
/// Fragments are identified by their position in the request; the label is only
/// used in diagnostics and never participates in the fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment<'a> {
    label: &'a str,
    data: &'a [u8],
}

impl<'a> Fragment<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { label: "", data }
    }

    pub fn labeled(label: &'a str, data: &'a [u8]) -> Self {
        Self { label, data }
    }

    pub fn label(&self) -> &'a str {
        self.label
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<'a> From<&'a [u8]> for Fragment<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::new(data)
    }
}

impl<'a> From<&'a str> for Fragment<'a> {
    fn from(source: &'a str) -> Self {
        Self::new(source.as_bytes())
    }
}

/// 128-bit key addressing a cache entry.
///
/// The key only selects a file. Whether that file answers a request is decided by
/// comparing the stored options and fragments byte for byte, so a collision costs
/// a recompile and never returns the wrong binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Width of [`Fingerprint::to_hex`] in characters.
    pub const HEX_LEN: usize = 32;

    /// Fingerprint an ordered set of fragments together with the build options.
    ///
    /// Each fragment is hashed on its own and folded into the accumulator with a
    /// rotation keyed by its index, so reordering fragments changes the key. The
    /// options hash (mixed with the fragment count) is folded in last.
    pub fn of(fragments: &[Fragment<'_>], options: &str) -> Self {
        let mut acc: u128 = 0;
        for (index, fragment) in fragments.iter().enumerate() {
            let hash = digest128(fragment.data());
            acc = acc.rotate_left(FOLD_ROTATION) ^ hash.rotate_left((index % 128) as u32);
        }
        let tail = digest128(options.as_bytes()) ^ fragments.len() as u128;
        Self(acc.rotate_left(FOLD_ROTATION) ^ tail)
    }

    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// Lowercase, zero-padded hex rendering; always [`Self::HEX_LEN`] characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes: [u8; 16] = hex::decode(text).ok()?.try_into().ok()?;
        Some(Self(u128::from_be_bytes(bytes)))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn digest128(bytes: &[u8]) -> u128 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_identical_requests() {
        let fragments = [Fragment::labeled("kernelA.cl", b"__kernel void k(){}")];
        assert_eq!(
            Fingerprint::of(&fragments, "-O2"),
            Fingerprint::of(&fragments, "-O2")
        );
    }

    #[test]
    fn options_change_the_key() {
        let fragments = [Fragment::new(b"__kernel void k(){}")];
        assert_ne!(
            Fingerprint::of(&fragments, "-O2"),
            Fingerprint::of(&fragments, "-O3")
        );
    }

    #[test]
    fn fragment_order_changes_the_key() {
        let a = Fragment::new(b"#define N 4");
        let b = Fragment::new(b"__kernel void k(){}");
        assert_ne!(Fingerprint::of(&[a, b], ""), Fingerprint::of(&[b, a], ""));
    }

    #[test]
    fn fragment_count_changes_the_key() {
        let a = Fragment::new(b"__kernel void k(){}");
        let empty = Fragment::new(b"");
        assert_ne!(Fingerprint::of(&[a], ""), Fingerprint::of(&[a, empty], ""));
        assert_ne!(Fingerprint::of(&[], ""), Fingerprint::of(&[empty], ""));
    }

    #[test]
    fn labels_do_not_participate() {
        let data: &[u8] = b"__kernel void k(){}";
        assert_eq!(
            Fingerprint::of(&[Fragment::labeled("a.cl", data)], "-O2"),
            Fingerprint::of(&[Fragment::labeled("b.cl", data)], "-O2")
        );
    }

    #[test]
    fn hex_is_fixed_width_and_round_trips() {
        let small = Fingerprint::from_raw(0xab);
        let hex = small.to_hex();
        assert_eq!(hex.len(), Fingerprint::HEX_LEN);
        assert_eq!(hex, "000000000000000000000000000000ab");
        assert_eq!(Fingerprint::from_hex(&hex), Some(small));
        assert_eq!(Fingerprint::from_hex("not hex"), None);
        assert_eq!(Fingerprint::from_hex("abcd"), None);
    }
}
