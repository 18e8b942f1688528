//! the datagram that goes on the wire between peers
//!
//! One audio period per datagram: a 16 byte header followed by the payload,
//! which is every channel's sample block back to back with no padding.  When
//! redundancy is on, the previous payloads ride along after the current one
//! so the receiver can fill gaps without any retransmission.  Everything is
//! little endian and packed tight; there is nothing to be gained here from
//! compression or variable layouts, the network just has to be fast.
use byteorder::{ByteOrder, LittleEndian};
use num_derive::{FromPrimitive, ToPrimitive};
use simple_error::bail;
use std::fmt;

use super::box_error::BoxError;

/// biggest datagram we will ever build or accept (header + redundant payloads)
pub const MAX_DATAGRAM_SIZE: usize = 16384;
/// fixed header size.  Fields are at hard offsets, see the accessors.
pub const HEADER_SIZE: usize = 8 + 2 + 2 + 1 + 1 + 1 + 1;

/// 8 bit code for the session sample rate carried in every header
#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum SampleRateCode {
    Sr22 = 0,
    Sr32,
    Sr44,
    Sr48,
    Sr88,
    Sr96,
    Sr192,
    Undef,
}

impl SampleRateCode {
    /// map a host reported rate onto the wire code.  Rates outside the fixed
    /// set come back Undef and the session must refuse to start.
    pub fn from_rate(rate: u32) -> SampleRateCode {
        match rate {
            22050 => SampleRateCode::Sr22,
            32000 => SampleRateCode::Sr32,
            44100 => SampleRateCode::Sr44,
            48000 => SampleRateCode::Sr48,
            88200 => SampleRateCode::Sr88,
            96000 => SampleRateCode::Sr96,
            192000 => SampleRateCode::Sr192,
            _ => SampleRateCode::Undef,
        }
    }
    pub fn rate(&self) -> Option<u32> {
        match self {
            SampleRateCode::Sr22 => Some(22050),
            SampleRateCode::Sr32 => Some(32000),
            SampleRateCode::Sr44 => Some(44100),
            SampleRateCode::Sr48 => Some(48000),
            SampleRateCode::Sr88 => Some(88200),
            SampleRateCode::Sr96 => Some(96000),
            SampleRateCode::Sr192 => Some(192000),
            SampleRateCode::Undef => None,
        }
    }
}

/// wire bit depth.  The discriminant is the actual bit count so the header
/// byte and the enum are the same number.
#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum BitResolution {
    Bit8 = 8,
    Bit16 = 16,
    Bit24 = 24,
    Bit32 = 32,
}

impl BitResolution {
    pub fn from_bits(bits: u8) -> Option<BitResolution> {
        num::FromPrimitive::from_u8(bits)
    }
    pub fn bytes(&self) -> usize {
        (*self as usize) / 8
    }
}

/// the message that gets read/written on the udp socket
///
/// super simple by design.  Just getters/setters over hard byte offsets to
/// keep the thing packed and little endian no matter what we run on.
pub struct PacketBuffer {
    buffer: [u8; MAX_DATAGRAM_SIZE],
    nbytes: usize,
}

impl PacketBuffer {
    pub fn new() -> PacketBuffer {
        PacketBuffer {
            buffer: [0; MAX_DATAGRAM_SIZE],
            nbytes: HEADER_SIZE,
        }
    }
    /// monotonic milliseconds since session start
    pub fn get_timestamp(&self) -> u64 {
        LittleEndian::read_u64(&self.buffer[0..8])
    }
    pub fn set_timestamp(&mut self, t: u64) -> () {
        LittleEndian::write_u64(&mut self.buffer[0..8], t)
    }
    /// sequence number of the newest payload in this datagram
    pub fn get_sequence_num(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer[8..10])
    }
    pub fn set_sequence_num(&mut self, seq: u16) -> () {
        LittleEndian::write_u16(&mut self.buffer[8..10], seq)
    }
    /// frames per packet (the audio period size)
    pub fn get_buffer_size(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer[10..12])
    }
    pub fn set_buffer_size(&mut self, frames: u16) -> () {
        LittleEndian::write_u16(&mut self.buffer[10..12], frames)
    }
    pub fn get_sample_rate_code(&self) -> u8 {
        self.buffer[12]
    }
    pub fn set_sample_rate_code(&mut self, code: SampleRateCode) -> () {
        self.buffer[12] = code as u8;
    }
    pub fn get_bit_resolution(&self) -> u8 {
        self.buffer[13]
    }
    pub fn set_bit_resolution(&mut self, res: BitResolution) -> () {
        self.buffer[13] = res as u8;
    }
    pub fn get_num_in_channels(&self) -> u8 {
        self.buffer[14]
    }
    pub fn set_num_in_channels(&mut self, n: u8) -> () {
        self.buffer[14] = n;
    }
    pub fn get_num_out_channels(&self) -> u8 {
        self.buffer[15]
    }
    pub fn set_num_out_channels(&mut self, n: u8) -> () {
        self.buffer[15] = n;
    }
    /// mutable view of the whole buffer (for recv_from)
    pub fn get_buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
    /// the slice that actually goes on the wire
    pub fn get_send_buffer(&self) -> &[u8] {
        &self.buffer[0..self.nbytes]
    }
    /// drop all payloads, keep the header
    pub fn clear_payloads(&mut self) -> () {
        self.nbytes = HEADER_SIZE;
    }
    /// append one payload block after whatever is already in here
    pub fn push_payload(&mut self, payload: &[u8]) -> Result<(), BoxError> {
        if self.nbytes + payload.len() > MAX_DATAGRAM_SIZE {
            bail!(
                "payload of {} bytes does not fit at offset {}",
                payload.len(),
                self.nbytes
            );
        }
        self.buffer[self.nbytes..self.nbytes + payload.len()].copy_from_slice(payload);
        self.nbytes += payload.len();
        Ok(())
    }
    /// how many payload blocks of this size the datagram carries
    pub fn payload_count(&self, payload_len: usize) -> usize {
        if payload_len == 0 || self.nbytes < HEADER_SIZE {
            return 0;
        }
        (self.nbytes - HEADER_SIZE) / payload_len
    }
    /// payload block i (0 is the newest, matching the header seq)
    pub fn payload(&self, i: usize, payload_len: usize) -> Option<&[u8]> {
        let start = HEADER_SIZE + i * payload_len;
        if start + payload_len > self.nbytes {
            return None;
        }
        Some(&self.buffer[start..start + payload_len])
    }
    /// set how many bytes a received datagram holds
    pub fn set_nbytes(&mut self, amt: usize) -> Result<(), BoxError> {
        if !self.is_valid(amt) {
            bail!("invalid packet of {} bytes", amt);
        }
        self.nbytes = amt;
        Ok(())
    }
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }
    /// sanity check a received size: at least a header and whole payloads
    pub fn is_valid(&self, amt: usize) -> bool {
        amt >= HEADER_SIZE && amt <= MAX_DATAGRAM_SIZE
    }
    /// a header only datagram of all ones means the peer is going away
    pub fn make_exit(&mut self) -> () {
        self.buffer[0..HEADER_SIZE].fill(0xff);
        self.nbytes = HEADER_SIZE;
    }
    pub fn is_exit(&self) -> bool {
        self.nbytes == HEADER_SIZE && self.buffer[0..HEADER_SIZE].iter().all(|b| *b == 0xff)
    }
}

impl fmt::Display for PacketBuffer {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ seq: {}, ts: {}, frames: {}, bits: {}, in: {}, out: {}, nbytes: {} }}",
            self.get_sequence_num(),
            self.get_timestamp(),
            self.get_buffer_size(),
            self.get_bit_resolution(),
            self.get_num_in_channels(),
            self.get_num_out_channels(),
            self.nbytes
        )
    }
}

/// the negotiated shape of one session's audio stream.
///
/// Both peers must agree on every field; the receive path checks each
/// incoming header against these values and drops anything that disagrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamParams {
    pub frames: u16,
    pub rate: SampleRateCode,
    pub bits: BitResolution,
    pub channels_in: u8,
    pub channels_out: u8,
}

impl StreamParams {
    /// bytes in one send side payload (what we put on the wire)
    pub fn payload_bytes_in(&self) -> usize {
        self.channels_in as usize * self.frames as usize * self.bits.bytes()
    }
    /// bytes in one receive side payload (what the peer puts on the wire)
    pub fn payload_bytes_out(&self) -> usize {
        self.channels_out as usize * self.frames as usize * self.bits.bytes()
    }
    /// stamp these parameters into a header
    pub fn fill_header(&self, msg: &mut PacketBuffer) -> () {
        msg.set_buffer_size(self.frames);
        msg.set_sample_rate_code(self.rate);
        msg.set_bit_resolution(self.bits);
        msg.set_num_in_channels(self.channels_in);
        msg.set_num_out_channels(self.channels_out);
    }
    /// check a received header against the negotiated values
    pub fn matches_header(&self, msg: &PacketBuffer) -> Result<(), String> {
        if msg.get_num_in_channels() != self.channels_in
            || msg.get_num_out_channels() != self.channels_out
        {
            return Err(format!(
                "channel count {}/{} (ours {}/{})",
                msg.get_num_in_channels(),
                msg.get_num_out_channels(),
                self.channels_in,
                self.channels_out
            ));
        }
        if msg.get_bit_resolution() != self.bits as u8 {
            return Err(format!(
                "bit resolution {} (ours {})",
                msg.get_bit_resolution(),
                self.bits as u8
            ));
        }
        if msg.get_buffer_size() != self.frames {
            return Err(format!(
                "buffer size {} (ours {})",
                msg.get_buffer_size(),
                self.frames
            ));
        }
        if msg.get_sample_rate_code() != self.rate as u8 {
            return Err(format!(
                "sample rate code {} (ours {})",
                msg.get_sample_rate_code(),
                self.rate as u8
            ));
        }
        Ok(())
    }
}

/// true when `new` is ahead of `last` under mod 2^16 arithmetic.
///
/// Half window compare: anything within 32768 ahead counts as newer, the
/// rest is late and gets dropped by the receiver.
pub fn seq_is_newer(new: u16, last: u16) -> bool {
    new != last && new.wrapping_sub(last) < 0x8000
}

#[cfg(test)]
mod test_packet {
    use super::*;

    #[test]
    fn header_round_trip() {
        // You should get back out of the header what you put in
        let mut msg = PacketBuffer::new();
        msg.set_timestamp(123456789);
        msg.set_sequence_num(0xfffe);
        msg.set_buffer_size(128);
        msg.set_sample_rate_code(SampleRateCode::Sr48);
        msg.set_bit_resolution(BitResolution::Bit16);
        msg.set_num_in_channels(2);
        msg.set_num_out_channels(2);
        assert_eq!(msg.get_timestamp(), 123456789);
        assert_eq!(msg.get_sequence_num(), 0xfffe);
        assert_eq!(msg.get_buffer_size(), 128);
        assert_eq!(msg.get_sample_rate_code(), SampleRateCode::Sr48 as u8);
        assert_eq!(msg.get_bit_resolution(), 16);
        assert_eq!(msg.get_num_in_channels(), 2);
        assert_eq!(msg.get_num_out_channels(), 2);
    }

    #[test]
    fn header_is_little_endian() {
        let mut msg = PacketBuffer::new();
        msg.set_sequence_num(0x0201);
        assert_eq!(msg.get_send_buffer()[8], 0x01);
        assert_eq!(msg.get_send_buffer()[9], 0x02);
    }

    #[test]
    fn payload_blocks() {
        // Payloads should stack after the header, newest first
        let mut msg = PacketBuffer::new();
        let newest = vec![1u8; 512];
        let prev = vec![2u8; 512];
        msg.push_payload(&newest).unwrap();
        msg.push_payload(&prev).unwrap();
        assert_eq!(msg.payload_count(512), 2);
        assert_eq!(msg.payload(0, 512).unwrap()[0], 1);
        assert_eq!(msg.payload(1, 512).unwrap()[0], 2);
        assert!(msg.payload(2, 512).is_none());
        msg.clear_payloads();
        assert_eq!(msg.payload_count(512), 0);
    }

    #[test]
    fn payload_overflow() {
        let mut msg = PacketBuffer::new();
        let big = vec![0u8; MAX_DATAGRAM_SIZE];
        assert!(msg.push_payload(&big).is_err());
    }

    #[test]
    fn is_valid() {
        let msg = PacketBuffer::new();
        assert_eq!(msg.is_valid(0), false);
        assert_eq!(msg.is_valid(HEADER_SIZE - 1), false);
        assert_eq!(msg.is_valid(HEADER_SIZE), true);
        assert_eq!(msg.is_valid(HEADER_SIZE + 128 * 2 * 2), true);
    }

    #[test]
    fn exit_packet() {
        let mut msg = PacketBuffer::new();
        assert!(!msg.is_exit());
        msg.make_exit();
        assert!(msg.is_exit());
    }

    #[test]
    fn rate_codes() {
        assert_eq!(SampleRateCode::from_rate(48000), SampleRateCode::Sr48);
        assert_eq!(SampleRateCode::from_rate(44100), SampleRateCode::Sr44);
        assert_eq!(SampleRateCode::from_rate(11025), SampleRateCode::Undef);
        assert_eq!(SampleRateCode::Sr96.rate(), Some(96000));
        assert_eq!(SampleRateCode::Undef.rate(), None);
    }

    #[test]
    fn bit_resolutions() {
        assert_eq!(BitResolution::from_bits(16), Some(BitResolution::Bit16));
        assert_eq!(BitResolution::from_bits(12), None);
        assert_eq!(BitResolution::Bit24.bytes(), 3);
    }

    #[test]
    fn stream_params_header_round_trip() {
        let params = StreamParams {
            frames: 256,
            rate: SampleRateCode::Sr48,
            bits: BitResolution::Bit16,
            channels_in: 2,
            channels_out: 2,
        };
        let mut msg = PacketBuffer::new();
        params.fill_header(&mut msg);
        assert!(params.matches_header(&msg).is_ok());
        assert_eq!(params.payload_bytes_in(), 2 * 256 * 2);

        msg.set_bit_resolution(BitResolution::Bit24);
        let err = params.matches_header(&msg).unwrap_err();
        assert!(err.contains("bit resolution"));
    }

    #[test]
    fn seq_window() {
        // Strictly newer within the half window, late otherwise
        assert!(seq_is_newer(1, 0));
        assert!(seq_is_newer(0, 0xffff)); // across the wrap
        assert!(!seq_is_newer(0, 0));
        assert!(!seq_is_newer(0xffff, 0)); // one behind
        assert!(seq_is_newer(0x7fff, 0));
        assert!(!seq_is_newer(0x8000, 0));
    }
}
