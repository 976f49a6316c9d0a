//! Defines mappings from stream channels to speaker positions.

use std::fmt;
use std::str::FromStr;

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::error::Error;
use crate::sample::{SampleSpec, CHANNELS_MAX};

/// Channel position labels.
#[derive(Debug, Copy, Clone, Primitive, PartialEq, Eq)]
pub enum ChannelPosition {
    Mono = 0,
    /// Apple, Dolby call this 'Left'.
    FrontLeft = 1,
    /// Apple, Dolby call this 'Right'.
    FrontRight = 2,
    /// Apple, Dolby call this 'Center'.
    FrontCenter = 3,
    /// Microsoft calls this 'Back Center', Apple calls this 'Center Surround'.
    RearCenter = 4,
    /// Microsoft calls this 'Back Left', Apple calls this 'Left Surround'.
    RearLeft = 5,
    /// Microsoft calls this 'Back Right', Apple calls this 'Right Surround'.
    RearRight = 6,
    /// Microsoft calls this 'Low Frequency', Apple calls this 'LFEScreen'.
    Lfe = 7,
    /// Apple, Dolby call this 'Left Center'.
    FrontLeftOfCenter = 8,
    /// Apple, Dolby call this 'Right Center'.
    FrontRightOfCenter = 9,
    /// Apple calls this 'Left Surround Direct', Dolby calls this 'Surround Left'.
    SideLeft = 10,
    /// Apple calls this 'Right Surround Direct', Dolby calls this 'Surround Right'.
    SideRight = 11,
    Aux0 = 12,
    Aux1 = 13,
    Aux2 = 14,
    Aux3 = 15,
    /// Apple calls this 'Top Center Surround'.
    TopCenter = 16,
    /// Apple calls this 'Vertical Height Left'.
    TopFrontLeft = 17,
    /// Apple calls this 'Vertical Height Right'.
    TopFrontRight = 18,
    /// Apple calls this 'Vertical Height Center'.
    TopFrontCenter = 19,
    /// Microsoft and Apple call this 'Top Back Left'.
    TopRearLeft = 20,
    /// Microsoft and Apple call this 'Top Back Right'.
    TopRearRight = 21,
    /// Microsoft and Apple call this 'Top Back Center'.
    TopRearCenter = 22,
}

impl ChannelPosition {
    /// Whether this position is on the left half of the sound stage.
    pub fn is_left(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            FrontLeft | RearLeft | FrontLeftOfCenter | SideLeft | TopFrontLeft | TopRearLeft
        )
    }

    /// Whether this position is on the right half of the sound stage.
    pub fn is_right(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            FrontRight | RearRight | FrontRightOfCenter | SideRight | TopFrontRight | TopRearRight
        )
    }

    /// Whether this position is in the front.
    pub fn is_front(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            FrontLeft
                | FrontRight
                | FrontCenter
                | FrontLeftOfCenter
                | FrontRightOfCenter
                | TopFrontLeft
                | TopFrontRight
                | TopFrontCenter
        )
    }

    /// Whether this position is in the rear.
    pub fn is_rear(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            RearLeft | RearRight | RearCenter | TopRearLeft | TopRearRight | TopRearCenter
        )
    }

    /// Whether this position is on the center line.
    pub fn is_center(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            FrontCenter | RearCenter | TopCenter | TopFrontCenter | TopRearCenter | Mono
        )
    }

    /// Whether this position is on a side.
    pub fn is_side(self) -> bool {
        use ChannelPosition::*;
        matches!(self, SideLeft | SideRight)
    }

    /// Whether this position is elevated.
    pub fn is_top(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            TopCenter
                | TopFrontLeft
                | TopFrontRight
                | TopFrontCenter
                | TopRearLeft
                | TopRearRight
                | TopRearCenter
        )
    }
}

/// A set of channel positions, used by mixer elements to describe which
/// abstract positions a hardware channel feeds.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PositionMask(u64);

impl PositionMask {
    /// The empty mask.
    pub const NONE: PositionMask = PositionMask(0);
    /// Every position.
    pub const ALL: PositionMask = PositionMask(u64::MAX);

    /// A mask containing only `pos`.
    pub fn position(pos: ChannelPosition) -> PositionMask {
        PositionMask(1 << pos as u64)
    }

    /// Whether `pos` is in the mask.
    pub fn contains(&self, pos: ChannelPosition) -> bool {
        self.0 & (1 << pos as u64) != 0
    }

    /// Adds `pos` to the mask.
    pub fn insert(&mut self, pos: ChannelPosition) {
        self.0 |= 1 << pos as u64;
    }

    /// The union of two masks.
    pub fn union(self, other: PositionMask) -> PositionMask {
        PositionMask(self.0 | other.0)
    }

    /// Whether the mask is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn from_predicate(f: impl Fn(ChannelPosition) -> bool) -> PositionMask {
        let mut mask = PositionMask::NONE;
        for raw in 0.. {
            match ChannelPosition::from_u32(raw) {
                Some(pos) => {
                    if f(pos) {
                        mask.insert(pos);
                    }
                }
                None => break,
            }
        }
        mask
    }
}

impl FromStr for PositionMask {
    type Err = Error;

    /// Parses the mask grammar used by path configuration: `all`, `all-left`,
    /// `all-right`, `all-front`, `all-rear`, `all-center`, `all-side`,
    /// `all-top`, `all-no-lfe`, or a single channel position name.
    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "all" => PositionMask::ALL,
            "all-left" => PositionMask::from_predicate(|p| p.is_left()),
            "all-right" => PositionMask::from_predicate(|p| p.is_right()),
            "all-front" => PositionMask::from_predicate(|p| p.is_front()),
            "all-rear" => PositionMask::from_predicate(|p| p.is_rear()),
            "all-center" => PositionMask::from_predicate(|p| p.is_center()),
            "all-side" => PositionMask::from_predicate(|p| p.is_side()),
            "all-top" => PositionMask::from_predicate(|p| p.is_top()),
            "all-no-lfe" => PositionMask::from_predicate(|p| p != ChannelPosition::Lfe),
            name => PositionMask::position(parse_position(name)?),
        })
    }
}

fn parse_position(s: &str) -> Result<ChannelPosition, Error> {
    use ChannelPosition::*;

    Ok(match s {
        "mono" => Mono,
        "front-left" => FrontLeft,
        "front-right" => FrontRight,
        "front-center" => FrontCenter,
        "rear-center" => RearCenter,
        "rear-left" => RearLeft,
        "rear-right" => RearRight,
        "lfe" => Lfe,
        "front-left-of-center" => FrontLeftOfCenter,
        "front-right-of-center" => FrontRightOfCenter,
        "side-left" => SideLeft,
        "side-right" => SideRight,
        "top-center" => TopCenter,
        "top-front-left" => TopFrontLeft,
        "top-front-right" => TopFrontRight,
        "top-front-center" => TopFrontCenter,
        "top-rear-left" => TopRearLeft,
        "top-rear-right" => TopRearRight,
        "top-rear-center" => TopRearCenter,
        _ => return Err(Error::Invalid(format!("unknown channel position: {}", s))),
    })
}

impl FromStr for ChannelMap {
    type Err = Error;

    /// Parses a comma-separated list of position names, e.g.
    /// `front-left,front-right`.
    fn from_str(s: &str) -> Result<Self, Error> {
        let mut map = ChannelMap::new();
        for part in s.split(',') {
            map.push(parse_position(part.trim())?)?;
        }
        if map.num_channels() == 0 {
            return Err(Error::Invalid("empty channel map".into()));
        }
        Ok(map)
    }
}

/// A map from stream channels to speaker positions.
///
/// These values are relevant for conversion and mixing of streams.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    /// Number of channels in the map.
    channels: u8,
    /// Channel position map.
    map: [ChannelPosition; CHANNELS_MAX as usize],
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            channels: 0,
            map: [ChannelPosition::Mono; CHANNELS_MAX as usize],
        }
    }
}

impl ChannelMap {
    /// Creates an empty channel map.
    pub fn new() -> Self {
        Default::default()
    }

    /// The standard map for a given channel count, if there is one.
    pub fn default_for(channels: u8) -> Result<ChannelMap, Error> {
        use ChannelPosition::*;

        let positions: &[ChannelPosition] = match channels {
            1 => &[Mono],
            2 => &[FrontLeft, FrontRight],
            3 => &[FrontLeft, FrontRight, FrontCenter],
            4 => &[FrontLeft, FrontRight, RearLeft, RearRight],
            5 => &[FrontLeft, FrontRight, FrontCenter, RearLeft, RearRight],
            6 => &[FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight],
            7 => &[
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                RearLeft,
                RearRight,
                RearCenter,
            ],
            8 => &[
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                RearLeft,
                RearRight,
                SideLeft,
                SideRight,
            ],
            _ => {
                return Err(Error::Invalid(format!(
                    "no default channel map for {} channels",
                    channels
                )))
            }
        };

        let mut map = ChannelMap::new();
        for &pos in positions {
            map.push(pos).unwrap();
        }
        Ok(map)
    }

    /// Tries to append another `ChannelPosition` to the end of this map.
    ///
    /// If the map is already at max. capacity, returns `Invalid`.
    pub fn push(&mut self, position: ChannelPosition) -> Result<(), Error> {
        *(self
            .map
            .get_mut(self.channels as usize)
            .ok_or_else(|| Error::Invalid("channel map full".into()))?) = position;
        self.channels += 1;
        Ok(())
    }

    /// Returns the number of channel mappings stored in this `ChannelMap`.
    pub fn num_channels(&self) -> u8 {
        self.channels
    }

    /// Whether this map can describe streams in `spec`.
    pub fn compatible_with(&self, spec: &SampleSpec) -> bool {
        self.channels == spec.channels
    }

    /// The position of channel `i`.
    pub fn position(&self, i: usize) -> ChannelPosition {
        self.map[i]
    }

    /// Iterates over the positions in the map.
    pub fn positions(&self) -> impl Iterator<Item = ChannelPosition> + '_ {
        self.map[..self.channels as usize].iter().copied()
    }

    /// The mask of every position present in the map.
    pub fn mask(&self) -> PositionMask {
        let mut mask = PositionMask::NONE;
        for pos in self.positions() {
            mask.insert(pos);
        }
        mask
    }
}

impl fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only print the occupied part of the backing storage
        self.map[..self.channels.into()].fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_maps() {
        let stereo = ChannelMap::default_for(2).unwrap();
        assert_eq!(stereo.num_channels(), 2);
        assert_eq!(stereo.position(0), ChannelPosition::FrontLeft);
        assert_eq!(stereo.position(1), ChannelPosition::FrontRight);

        assert!(ChannelMap::default_for(9).is_err());
    }

    #[test]
    fn mask_grammar() {
        let left: PositionMask = "all-left".parse().unwrap();
        assert!(left.contains(ChannelPosition::FrontLeft));
        assert!(left.contains(ChannelPosition::RearLeft));
        assert!(!left.contains(ChannelPosition::FrontRight));

        let no_lfe: PositionMask = "all-no-lfe".parse().unwrap();
        assert!(!no_lfe.contains(ChannelPosition::Lfe));
        assert!(no_lfe.contains(ChannelPosition::FrontCenter));

        let single: PositionMask = "front-left".parse().unwrap();
        assert_eq!(single, PositionMask::position(ChannelPosition::FrontLeft));

        assert!("bogus".parse::<PositionMask>().is_err());
    }
}
