//! Identifier encoding for the terminal-visible id, and colour/diacritic
//! derivation used by the placeholder renderer.
//!
//! The byte layout mirrors the one `protocol/kitty.rs` uses when it splits a
//! `u32` id into `[id_extra, id_r, id_g, id_b]` via `to_be_bytes()`.

use rand::Rng;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IDSpace {
    Bit8,
    Bit8Diacritic,
    Bit16,
    Bit24,
    Bit32,
}

impl IDSpace {
    pub fn name(&self) -> &'static str {
        match self {
            IDSpace::Bit8 => "8bit",
            IDSpace::Bit8Diacritic => "8bit_diacritic",
            IDSpace::Bit16 => "16bit",
            IDSpace::Bit24 => "24bit",
            IDSpace::Bit32 => "32bit",
        }
    }

    pub fn parse(text: &str) -> Result<IDSpace> {
        match text {
            "8bit" => Ok(IDSpace::Bit8),
            "8bit_diacritic" => Ok(IDSpace::Bit8Diacritic),
            "16bit" => Ok(IDSpace::Bit16),
            "24bit" => Ok(IDSpace::Bit24),
            "32bit" => Ok(IDSpace::Bit32),
            other => Err(Error::InvalidArg(format!("unknown id space {other:?}"))),
        }
    }
}

/// Half-open high-byte range `[begin, end)`, `0 <= begin < end <= 256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subspace {
    pub begin: u16,
    pub end: u16,
}

impl Subspace {
    pub fn new(begin: u16, end: u16) -> Result<Subspace> {
        if begin >= end || end > 256 || end - begin < 1 {
            return Err(Error::InvalidSubspace(format!("{begin}:{end}")));
        }
        // The subspace must contain at least one non-zero high byte.
        if begin == 0 && end == 1 {
            return Err(Error::InvalidSubspace(format!("{begin}:{end}")));
        }
        Ok(Subspace { begin, end })
    }

    pub fn parse(text: &str) -> Result<Subspace> {
        let (begin, end) = text
            .split_once(':')
            .ok_or_else(|| Error::InvalidSubspace(text.to_string()))?;
        let begin: u16 = begin
            .parse()
            .map_err(|_| Error::InvalidSubspace(text.to_string()))?;
        let end: u16 = end
            .parse()
            .map_err(|_| Error::InvalidSubspace(text.to_string()))?;
        Subspace::new(begin, end).map_err(|_| Error::InvalidSubspace(text.to_string()))
    }

    fn contains(&self, high_byte: u8) -> bool {
        let b = u16::from(high_byte);
        b >= self.begin && b < self.end
    }
}

/// Produce a uniformly random identifier in `space`, with its high byte
/// constrained to `subspace` when set, and its significant bytes non-zero
/// (except the reserved `id = 0` slot, which this function never returns).
pub fn random_id(space: IDSpace, subspace: Option<Subspace>) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let high: u8 = match subspace {
            Some(sub) => rng.gen_range(sub.begin..sub.end) as u8,
            None => rng.gen_range(1..=255),
        };
        let id: u32 = match space {
            IDSpace::Bit8 => u32::from(if subspace.is_some() { high } else { rng.gen_range(1..=255) }),
            IDSpace::Bit8Diacritic => u32::from(high) << 24,
            IDSpace::Bit16 => {
                let low: u8 = rng.gen_range(1..=255);
                (u32::from(high) << 8) | u32::from(low)
            }
            IDSpace::Bit24 => {
                let mid: u8 = rng.r#gen();
                let low: u8 = rng.r#gen();
                (u32::from(high) << 16) | (u32::from(mid) << 8) | u32::from(low)
            }
            IDSpace::Bit32 => {
                let b2: u8 = rng.r#gen();
                let b1: u8 = rng.r#gen();
                let b0: u8 = rng.r#gen();
                u32::from_be_bytes([high, b2, b1, b0])
            }
        };
        if id != 0 {
            return id;
        }
    }
}

/// Whether `id` lies in `space` and satisfies `subspace` when set.
pub fn id_in_space(id: u32, space: IDSpace, subspace: Option<Subspace>) -> bool {
    match space {
        IDSpace::Bit8 => id <= 0xff,
        IDSpace::Bit8Diacritic => {
            let [extra, r, g, b] = id.to_be_bytes();
            r == 0 && g == 0 && b == 0 && subspace.map(|s| s.contains(extra)).unwrap_or(true)
        }
        IDSpace::Bit16 => {
            let [extra, r, _g, _b] = id.to_be_bytes();
            extra == 0 && id <= 0xffff && subspace.map(|s| s.contains(r)).unwrap_or(true)
        }
        IDSpace::Bit24 => {
            let [extra, r, _g, _b] = id.to_be_bytes();
            extra == 0 && subspace.map(|s| s.contains(r)).unwrap_or(true)
        }
        IDSpace::Bit32 => {
            let [extra, _r, _g, _b] = id.to_be_bytes();
            subspace.map(|s| s.contains(extra)).unwrap_or(true)
        }
    }
}

/// Colour mode and colour that the placeholder renderer needs to emit for an
/// id/space pair, plus the optional fourth-byte diacritic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colour {
    Indexed(u8),
    Rgb(u8, u8, u8),
}

pub fn id_to_cell_colour(id: u32, space: IDSpace) -> (Colour, Option<u8>) {
    let [extra, r, g, b] = id.to_be_bytes();
    match space {
        IDSpace::Bit8 => (Colour::Indexed((id & 0xff) as u8), None),
        IDSpace::Bit8Diacritic => (Colour::Indexed(0), Some(extra)),
        IDSpace::Bit16 => (Colour::Indexed(r), Some(b)),
        IDSpace::Bit24 => (Colour::Rgb(g, r, b), None),
        IDSpace::Bit32 => (Colour::Rgb(g, r, b), Some(extra)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_subspace() {
        assert!(Subspace::parse("0:1").is_err());
        assert!(Subspace::parse("0:1024").is_err());
        assert!(Subspace::parse("abc").is_err());
        assert!(Subspace::parse("a:b").is_err());
    }

    #[test]
    fn accepts_valid_subspace() {
        let sub = Subspace::parse("42:43").unwrap();
        assert_eq!(sub, Subspace { begin: 42, end: 43 });
    }

    #[test]
    fn random_id_respects_subspace_high_byte() {
        let sub = Subspace::new(42, 43).unwrap();
        for _ in 0..200 {
            let id = random_id(IDSpace::Bit24, Some(sub));
            assert!(id_in_space(id, IDSpace::Bit24, Some(sub)));
            let [_, high, _, _] = id.to_be_bytes();
            assert_eq!(high, 42);
        }
    }

    #[test]
    fn id_to_cell_colour_24bit_matches_rgb_triple() {
        let (colour, diacritic) = id_to_cell_colour(0x0012_3456, IDSpace::Bit24);
        assert_eq!(colour, Colour::Rgb(0x12, 0x34, 0x56));
        assert_eq!(diacritic, None);
    }

    #[test]
    fn id_to_cell_colour_8bit_diacritic_uses_high_byte() {
        let (colour, diacritic) = id_to_cell_colour(0x2a00_0000, IDSpace::Bit8Diacritic);
        assert_eq!(colour, Colour::Indexed(0));
        assert_eq!(diacritic, Some(0x2a));
    }

    #[test]
    fn random_id_never_zero() {
        for _ in 0..500 {
            assert_ne!(random_id(IDSpace::Bit8, None), 0);
            assert_ne!(random_id(IDSpace::Bit8Diacritic, None), 0);
        }
    }
}
