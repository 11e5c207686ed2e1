use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Feedback message type of REMB within payload-specific feedback
pub const REMB_FMT: u8 = 15;

const REMB_IDENTIFIER: &[u8; 4] = b"REMB";
const MANTISSA_MAX: u64 = (1 << 18) - 1;

/// Receiver Estimated Maximum Bitrate
/// (draft-alvestrand-rmcat-remb, carried as PSFB with FMT=15)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpRemb {
    /// SSRC of the packet sender
    pub sender_ssrc: RtpSsrc,

    /// Estimated bitrate in bits per second
    pub bitrate_bps: u64,

    /// Media sources the estimate applies to
    pub ssrcs: Vec<RtpSsrc>,
}

impl RtcpRemb {
    /// Create an estimate for the given media sources
    pub fn new(sender_ssrc: RtpSsrc, bitrate_bps: u64, ssrcs: Vec<RtpSsrc>) -> Self {
        Self {
            sender_ssrc,
            bitrate_bps,
            ssrcs,
        }
    }

    /// Body size in bytes, without the common header
    pub fn size(&self) -> usize {
        16 + self.ssrcs.len() * 4
    }

    /// Serialize the body
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.ssrcs.len() > u8::MAX as usize {
            return Err(Error::EncodeError(format!("REMB with {} SSRCs", self.ssrcs.len())));
        }

        let mut exponent = 0u32;
        while (self.bitrate_bps >> exponent) > MANTISSA_MAX {
            exponent += 1;
        }
        let mantissa = (self.bitrate_bps >> exponent) as u32;

        buf.reserve(self.size());
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(0);
        buf.put_slice(REMB_IDENTIFIER);
        buf.put_u8(self.ssrcs.len() as u8);
        buf.put_u8(((exponent as u8) << 2) | ((mantissa >> 16) as u8 & 0x03));
        buf.put_u16((mantissa & 0xFFFF) as u16);
        for ssrc in &self.ssrcs {
            buf.put_u32(*ssrc);
        }
        Ok(())
    }
}

/// Parse a REMB body; `None` when the feedback is another PSFB/AFB message
pub fn parse_remb(buf: &mut impl Buf) -> Result<Option<RtcpRemb>> {
    if buf.remaining() < 16 {
        return Err(Error::BufferTooSmall {
            required: 16,
            available: buf.remaining(),
        });
    }

    let sender_ssrc = buf.get_u32();
    let _media_ssrc = buf.get_u32();
    let mut identifier = [0u8; 4];
    buf.copy_to_slice(&mut identifier);
    if &identifier != REMB_IDENTIFIER {
        return Ok(None);
    }

    let count = buf.get_u8() as usize;
    let exp_mantissa = buf.get_u8();
    let exponent = exp_mantissa >> 2;
    let mantissa = ((exp_mantissa & 0x03) as u64) << 16 | buf.get_u16() as u64;

    if buf.remaining() < count * 4 {
        return Err(Error::BufferTooSmall {
            required: count * 4,
            available: buf.remaining(),
        });
    }
    let ssrcs = (0..count).map(|_| buf.get_u32()).collect();

    let bitrate_bps = mantissa
        .checked_shl(exponent as u32)
        .ok_or_else(|| Error::RtcpError(format!("REMB exponent {} out of range", exponent)))?;

    Ok(Some(RtcpRemb {
        sender_ssrc,
        bitrate_bps,
        ssrcs,
    }))
}
