use super::{AddressKey, RangeSpec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::RangeInclusive;

/// Largest value of the upper 24 bits of a 4-byte address.
const V4_WALK_LIMIT: u32 = 0x00FF_FFFF;

/// Turns a [`RangeSpec`] into concrete [`AddressKey`] targets.
///
/// Two policies exist for 4-byte ranges:
///
/// **Exhaustive**: every value of the last octet between the floor and
/// `floor + hosts` is yielded, for every step of the upper 24 bits.
///
/// **Sampled**: a single address is yielded per step of the upper 24 bits,
/// with its last octet drawn uniformly from the same interval.
///
/// 16-byte ranges are always sampled: each step randomizes the last two bytes,
/// then moves the running address forward with a random carry walk (see
/// [`advance_v6`]). Only the last octet is ever varied for 4-byte ranges, so
/// ranges wider than a /24 are capped at 256 addresses per step.
///
/// ```rust
/// # use rangeping::address::{RangeExpander, RangeSpec};
/// let spec = RangeSpec::parse("192.168.0.0/30", 80).unwrap();
/// let targets: Vec<_> = RangeExpander::new(true).expand(&spec).collect();
/// assert_eq!(targets.len(), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeExpander {
    exhaustive: bool,
    seed: Option<u64>,
}

impl RangeExpander {
    /// Builds an expander drawing its samples from the thread RNG.
    pub const fn new(exhaustive: bool) -> Self {
        Self {
            exhaustive,
            seed: None,
        }
    }

    /// Builds an expander whose samples are reproducible for a given seed.
    pub const fn seeded(exhaustive: bool, seed: u64) -> Self {
        Self {
            exhaustive,
            seed: Some(seed),
        }
    }

    pub const fn is_exhaustive(&self) -> bool {
        self.exhaustive
    }

    /// Starts a new lazy expansion of `spec`. Expansions cannot be rewound;
    /// call this again to restart one.
    pub fn expand(&self, spec: &RangeSpec) -> Expansion {
        if spec.is_single() {
            return Expansion::Single(Some(AddressKey::new(spec.base(), spec.port())));
        }

        let rng = self.seed.map_or_else(
            || StdRng::from_rng(&mut rand::rng()),
            StdRng::seed_from_u64,
        );

        match spec.base() {
            IpAddr::V4(base) => Expansion::V4(Ipv4Walk::new(
                base,
                spec.prefix(),
                spec.port(),
                self.exhaustive,
                rng,
            )),
            IpAddr::V6(base) => Expansion::V6(Ipv6Walk::new(base, spec.prefix(), spec.port(), rng)),
        }
    }
}

/// Lazy sequence of targets produced by [`RangeExpander::expand`].
#[derive(Debug)]
pub enum Expansion {
    Single(Option<AddressKey>),
    V4(Ipv4Walk),
    V6(Ipv6Walk),
}

impl Iterator for Expansion {
    type Item = AddressKey;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Single(key) => key.take(),
            Self::V4(walk) => walk.next(),
            Self::V6(walk) => walk.next(),
        }
    }
}

/// Walk over a 4-byte range, see [`RangeExpander`].
#[derive(Debug)]
pub struct Ipv4Walk {
    current: Option<u32>,
    mask: u32,
    network: u32,
    floor: u8,
    hosts: u8,
    exhaustive: bool,
    row: RangeInclusive<u8>,
    port: u16,
    rng: StdRng,
}

impl Ipv4Walk {
    fn new(base: Ipv4Addr, prefix: u8, port: u16, exhaustive: bool, rng: StdRng) -> Self {
        let mask = v4_mask(prefix);
        let current = u32::from(base);
        let floor = base.octets()[3] & mask.to_be_bytes()[3];
        let hosts = last_octet_hosts(prefix);

        Self {
            current: Some(current),
            mask,
            network: current & mask,
            floor,
            hosts,
            exhaustive,
            row: floor..=floor + hosts,
            port,
            rng,
        }
    }

    fn key(&self, upper: u32, last: u8) -> AddressKey {
        let address = Ipv4Addr::from((upper & !0xFF) | u32::from(last));
        AddressKey::new(IpAddr::V4(address), self.port)
    }
}

impl Iterator for Ipv4Walk {
    type Item = AddressKey;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current = self.current?;
            if current & self.mask != self.network {
                self.current = None;
                return None;
            }

            if !self.exhaustive {
                let last = self.floor + self.rng.random_range(0..=self.hosts);
                self.current = advance_v4(current);
                return Some(self.key(current, last));
            }

            if let Some(last) = self.row.next() {
                return Some(self.key(current, last));
            }
            self.row = self.floor..=self.floor + self.hosts;
            self.current = advance_v4(current);
        }
    }
}

/// Walk over a 16-byte range, see [`RangeExpander`].
#[derive(Debug)]
pub struct Ipv6Walk {
    current: Option<u128>,
    mask: u128,
    network: u128,
    port: u16,
    rng: StdRng,
}

impl Ipv6Walk {
    fn new(base: Ipv6Addr, prefix: u8, port: u16, rng: StdRng) -> Self {
        let mask = v6_mask(prefix);
        let current = u128::from(base);

        Self {
            current: Some(current),
            mask,
            network: current & mask,
            port,
            rng,
        }
    }
}

impl Iterator for Ipv6Walk {
    type Item = AddressKey;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        if current & self.mask != self.network {
            self.current = None;
            return None;
        }

        let tail: u16 = self.rng.random();
        let sampled = (current & !0xFFFF) | u128::from(tail);

        let rng = &mut self.rng;
        self.current = advance_v6(sampled, || rng.random());

        Some(AddressKey::new(
            IpAddr::V6(Ipv6Addr::from(sampled)),
            self.port,
        ))
    }
}

/// Netmask of a 4-byte prefix as an integer.
pub const fn v4_mask(prefix: u8) -> u32 {
    match u32::MAX.checked_shl(32 - prefix as u32) {
        Some(mask) => mask,
        None => 0,
    }
}

/// Netmask of a 16-byte prefix as an integer.
pub const fn v6_mask(prefix: u8) -> u128 {
    match u128::MAX.checked_shl(128 - prefix as u32) {
        Some(mask) => mask,
        None => 0,
    }
}

/// Number of host values above the floor in the last octet, capped at 255.
pub const fn last_octet_hosts(prefix: u8) -> u8 {
    let host_bits = 32u32.saturating_sub(prefix as u32);
    if host_bits >= 8 {
        u8::MAX
    } else {
        (1u8 << host_bits) - 1
    }
}

/// Moves a 4-byte address to the next third-octet step, carrying into the
/// second and first octets. The last octet is left untouched.
///
/// Returns `None` once the carry leaves the first octet.
///
/// ```rust
/// # use rangeping::address::advance_v4;
/// # use std::net::Ipv4Addr;
/// let next = advance_v4(Ipv4Addr::new(10, 0, 255, 7).into());
/// assert_eq!(next, Some(Ipv4Addr::new(10, 1, 0, 7).into()));
/// ```
pub const fn advance_v4(address: u32) -> Option<u32> {
    let upper = (address >> 8) + 1;
    if upper > V4_WALK_LIMIT {
        return None;
    }
    Some((upper << 8) | (address & 0xFF))
}

/// Random carry step over bytes 0..=13 of a 16-byte address.
///
/// Starting from the third-to-last byte and moving towards the first one, a
/// value from `addend` is added to each byte (wrapping). The walk stops at the
/// first byte that did not wrap. Returns `None` when every byte wrapped, i.e.
/// the carry left the address.
pub fn advance_v6(address: u128, mut addend: impl FnMut() -> u8) -> Option<u128> {
    let mut octets = address.to_be_bytes();

    for index in (0..14).rev() {
        let previous = octets[index];
        octets[index] = previous.wrapping_add(addend());
        if octets[index] >= previous {
            return Some(u128::from_be_bytes(octets));
        }
    }

    None
}
