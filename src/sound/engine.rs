//! the real time engine: one call per audio period, in both directions
//!
//! The engine owns no socket and no thread.  It gets a producer endpoint
//! into the send ring and a consumer endpoint out of the receive ring at
//! construction and talks to nothing else, which is what makes it testable
//! without an audio host.  Everything it needs per period was allocated in
//! `setup`; the `process` path allocates nothing, locks nothing, and never
//! blocks.
use std::sync::Arc;

use log::warn;

use crate::common::error::{ErrorSlot, SessionError};
use crate::common::packet::BitResolution;
use crate::sound::codec;
use crate::sound::plugin::{BoxedPlugin, PluginChain};
use crate::sound::ring::{RingConsumer, RingProducer, RingRead};

/// hard cap on channels per session, sized so callback-side channel
/// bookkeeping can live on the stack
pub const MAX_CHANNELS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineState {
    Ready,
    Running,
    Closed,
}

pub struct AudioEngine {
    num_in: usize,
    num_out: usize,
    frames: usize,
    res: BitResolution,
    bytes_per_chan: usize,
    to_net: RingProducer,
    from_net: RingConsumer,
    send_scratch: Vec<u8>,
    recv_scratch: Vec<u8>,
    to_net_chain: PluginChain,
    from_net_chain: PluginChain,
    out_buf: Vec<Vec<f32>>,
    mix_buf: Vec<Vec<f32>>,
    fade_frames: usize,
    state: EngineState,
    error_slot: Arc<ErrorSlot>,
}

impl AudioEngine {
    /// allocate every buffer the period path will touch.
    ///
    /// `bits` must be one of {8, 16, 24, 32} and the ring slots must be
    /// sized to exactly one payload for their side.
    pub fn setup(
        channels_in: usize,
        channels_out: usize,
        bits: u8,
        period_frames: usize,
        to_net: RingProducer,
        from_net: RingConsumer,
        error_slot: Arc<ErrorSlot>,
    ) -> Result<AudioEngine, SessionError> {
        let res = BitResolution::from_bits(bits)
            .ok_or_else(|| SessionError::ConfigInvalid(format!("bit resolution {}", bits)))?;
        if channels_in == 0 || channels_in > MAX_CHANNELS {
            return Err(SessionError::ConfigInvalid(format!(
                "{} input channels",
                channels_in
            )));
        }
        if channels_out == 0 || channels_out > MAX_CHANNELS {
            return Err(SessionError::ConfigInvalid(format!(
                "{} output channels",
                channels_out
            )));
        }
        if period_frames == 0 {
            return Err(SessionError::ConfigInvalid("zero period".to_string()));
        }
        let bytes_per_chan = period_frames * res.bytes();
        if to_net.slot_bytes() != channels_in * bytes_per_chan {
            return Err(SessionError::ConfigInvalid(format!(
                "send ring slots are {} bytes, payload is {}",
                to_net.slot_bytes(),
                channels_in * bytes_per_chan
            )));
        }
        if from_net.slot_bytes() != channels_out * bytes_per_chan {
            return Err(SessionError::ConfigInvalid(format!(
                "receive ring slots are {} bytes, payload is {}",
                from_net.slot_bytes(),
                channels_out * bytes_per_chan
            )));
        }
        Ok(AudioEngine {
            num_in: channels_in,
            num_out: channels_out,
            frames: period_frames,
            res,
            bytes_per_chan,
            send_scratch: vec![0; channels_in * bytes_per_chan],
            recv_scratch: vec![0; channels_out * bytes_per_chan],
            to_net_chain: PluginChain::new(channels_in, period_frames),
            from_net_chain: PluginChain::new(channels_out, period_frames),
            out_buf: vec![vec![0.0; period_frames]; channels_out],
            mix_buf: vec![vec![0.0; period_frames]; channels_in],
            fade_frames: 0,
            to_net,
            from_net,
            state: EngineState::Ready,
            error_slot,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }
    pub fn frames(&self) -> usize {
        self.frames
    }
    pub fn channels_in(&self) -> usize {
        self.num_in
    }
    pub fn channels_out(&self) -> usize {
        self.num_out
    }
    /// smooth the loop seam when a replayed period repeats, over the last
    /// `k` frames.  Zero (the default) replays the slot untouched.
    pub fn set_replay_fade(&mut self, k: usize) -> () {
        self.fade_frames = k;
    }

    /// extend the capture side effect chain.  Only before the engine runs.
    pub fn append_plugin_to_network(&mut self, plugin: BoxedPlugin) -> Result<(), SessionError> {
        if self.state != EngineState::Ready {
            return Err(SessionError::ConfigInvalid(
                "plugins must be added before the engine starts".to_string(),
            ));
        }
        self.to_net_chain
            .append(plugin)
            .map_err(SessionError::ConfigInvalid)
    }
    /// extend the playback side effect chain.  Only before the engine runs.
    pub fn append_plugin_from_network(&mut self, plugin: BoxedPlugin) -> Result<(), SessionError> {
        if self.state != EngineState::Ready {
            return Err(SessionError::ConfigInvalid(
                "plugins must be added before the engine starts".to_string(),
            ));
        }
        self.from_net_chain
            .append(plugin)
            .map_err(SessionError::ConfigInvalid)
    }

    /// the audio host called shutdown on us; park the error and go silent
    pub fn close(&mut self, why: &str) -> () {
        if self.state != EngineState::Closed {
            warn!("engine closing: {}", why);
            self.state = EngineState::Closed;
            self.error_slot
                .raise(SessionError::AudioHostShutdown(why.to_string()));
        }
    }

    /// the periodic callback.  `inputs` must hold `channels_in` slices and
    /// `outputs` `channels_out` slices, each `period_frames` long.
    pub fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> () {
        if self.state == EngineState::Closed {
            for out in outputs.iter_mut() {
                out.fill(0.0);
            }
            return;
        }
        self.state = EngineState::Running;
        let bps = self.res.bytes();

        // 1. one payload out of the receive ring, underrun policy applied
        let read = self.from_net.pop(&mut self.recv_scratch);

        // 2. unpack the payload into per channel floats
        for c in 0..self.num_out {
            let chan = &self.recv_scratch[c * self.bytes_per_chan..(c + 1) * self.bytes_per_chan];
            for j in 0..self.frames {
                self.out_buf[c][j] = codec::bits_to_sample(&chan[j * bps..(j + 1) * bps], self.res);
            }
        }
        if read == RingRead::Replay && self.fade_frames > 0 {
            self.smooth_replay_seam();
        }

        // 3. playback side effect chain, result goes to the host
        self.from_net_chain.run(&mut self.out_buf);
        for (c, out) in outputs.iter_mut().enumerate() {
            out[..self.frames].copy_from_slice(&self.out_buf[c][..self.frames]);
        }

        // 4. capture side chain output sums with the live input
        for c in 0..self.num_in {
            self.mix_buf[c][..self.frames].copy_from_slice(&inputs[c][..self.frames]);
        }
        if !self.to_net_chain.is_empty() {
            self.to_net_chain.run(&mut self.mix_buf);
            for c in 0..self.num_in {
                for j in 0..self.frames {
                    self.mix_buf[c][j] += inputs[c][j];
                }
            }
        }

        // 5. pack the mix into the wire format
        for c in 0..self.num_in {
            let chan =
                &mut self.send_scratch[c * self.bytes_per_chan..(c + 1) * self.bytes_per_chan];
            for j in 0..self.frames {
                codec::sample_to_bits(self.mix_buf[c][j], &mut chan[j * bps..(j + 1) * bps], self.res);
            }
        }

        // 6. hand it to the sender.  Full ring sheds the oldest slot.
        self.to_net.push(&self.send_scratch);
    }

    fn smooth_replay_seam(&mut self) -> () {
        let k = self.fade_frames.min(self.frames);
        if k == 0 {
            return;
        }
        for c in 0..self.num_out {
            let first = self.out_buf[c][0];
            for i in 0..k {
                let t = (i + 1) as f32 / k as f32;
                let j = self.frames - k + i;
                self.out_buf[c][j] = self.out_buf[c][j] * (1.0 - t) + first * t;
            }
        }
    }
}
