//! Defines types that specify how samples are encoded.

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::error::Error;
use crate::props::Props;

/// Describes how samples are encoded.
#[derive(Debug, Copy, Clone, Primitive, PartialEq, Eq)]
pub enum FormatEncoding {
    /// Any encoding is supported.
    Any = 0,
    /// Good old PCM.
    Pcm = 1,
    /// AC3 data encapsulated in IEC 61937 header/padding.
    Ac3Iec61937 = 2,
    /// EAC3 data encapsulated in IEC 61937 header/padding.
    Eac3Iec61937 = 3,
    /// MPEG-1 or MPEG-2 (Part 3, not AAC) data encapsulated in IEC 61937 header/padding.
    MpegIec61937 = 4,
    /// DTS data encapsulated in IEC 61937 header/padding.
    DtsIec61937 = 5,
    /// MPEG-2 AAC data encapsulated in IEC 61937 header/padding.
    Mpeg2Iec61937 = 6,
}

/// Sample encoding info.
///
/// Associates a simple `FormatEncoding` with a list of arbitrary properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    encoding: FormatEncoding,
    props: Props,
}

impl FormatInfo {
    /// Create a new `FormatInfo` from a sample encoding with an empty property list.
    pub fn new(encoding: FormatEncoding) -> Self {
        Self {
            encoding,
            props: Props::new(),
        }
    }

    /// Create a `FormatInfo` from a raw encoding value.
    pub fn from_raw(encoding: u8, props: Props) -> Result<Self, Error> {
        let encoding = FormatEncoding::from_u8(encoding)
            .ok_or_else(|| Error::Invalid(format!("invalid encoding: {}", encoding)))?;

        Ok(Self { encoding, props })
    }

    /// Get the actual sample encoding.
    pub fn encoding(&self) -> FormatEncoding {
        self.encoding
    }

    /// Whether this is plain PCM, as opposed to an encapsulated bitstream.
    ///
    /// Non-PCM streams are forwarded unmodified (passthrough) and exclude
    /// mixing and volume.
    pub fn is_pcm(&self) -> bool {
        self.encoding == FormatEncoding::Pcm
    }

    /// Get a reference to the property list for this `FormatInfo` object.
    pub fn props(&self) -> &Props {
        &self.props
    }

    /// Get a mutable reference to the property list for this `FormatInfo` object.
    pub fn props_mut(&mut self) -> &mut Props {
        &mut self.props
    }

    /// Whether a requested format is satisfied by an advertised one.
    pub fn compatible_with(&self, advertised: &FormatInfo) -> bool {
        self.encoding == FormatEncoding::Any
            || advertised.encoding == FormatEncoding::Any
            || self.encoding == advertised.encoding
    }
}

/// Picks the format a new stream will use: the first requested format that an
/// advertised format satisfies.
///
/// Returns `NotSupported` when nothing matches.
pub fn negotiate(requested: &[FormatInfo], advertised: &[FormatInfo]) -> Result<FormatInfo, Error> {
    for req in requested {
        if let Some(adv) = advertised.iter().find(|adv| req.compatible_with(adv)) {
            let chosen = if req.encoding() == FormatEncoding::Any {
                adv.clone()
            } else {
                req.clone()
            };
            return Ok(chosen);
        }
    }

    Err(Error::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn negotiation_prefers_request_order() {
        let requested = vec![
            FormatInfo::new(FormatEncoding::Ac3Iec61937),
            FormatInfo::new(FormatEncoding::Pcm),
        ];
        let advertised = vec![FormatInfo::new(FormatEncoding::Pcm)];

        let chosen = negotiate(&requested, &advertised).unwrap();
        assert_eq!(chosen.encoding(), FormatEncoding::Pcm);
    }

    #[test]
    fn negotiation_any_resolves_to_advertised() {
        let requested = vec![FormatInfo::new(FormatEncoding::Any)];
        let advertised = vec![FormatInfo::new(FormatEncoding::DtsIec61937)];

        let chosen = negotiate(&requested, &advertised).unwrap();
        assert_eq!(chosen.encoding(), FormatEncoding::DtsIec61937);
    }

    #[test]
    fn negotiation_failure() {
        let requested = vec![FormatInfo::new(FormatEncoding::Ac3Iec61937)];
        let advertised = vec![FormatInfo::new(FormatEncoding::Pcm)];
        assert_matches!(negotiate(&requested, &advertised), Err(Error::NotSupported));
    }
}
