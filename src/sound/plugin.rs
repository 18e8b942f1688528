//! effect plugins and the chains the engine runs them in
//!
//! A plugin sees per channel sample buffers and nothing else.  It may
//! allocate whatever it wants when it is built; once the session is running
//! `compute` gets called from the audio callback and must not allocate,
//! lock, or block.  Plugins are owned by the chain for their whole life and
//! have to be appended before the engine starts.
use crate::dsp::peak_detector::PeakDetector;

/// one effect in a chain.  `compute` reads `inputs` and fills `outputs`;
/// both are `channels` buffers of `frames` samples.
pub trait ProcessPlugin: Send {
    fn num_inputs(&self) -> usize;
    fn num_outputs(&self) -> usize;
    fn compute(&mut self, frames: usize, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) -> ();
}

pub type BoxedPlugin = Box<dyn ProcessPlugin>;

/// ordered list of plugins with the scratch buffers to ping pong through
pub struct PluginChain {
    plugins: Vec<BoxedPlugin>,
    channels: usize,
    frames: usize,
    buf_a: Vec<Vec<f32>>,
    buf_b: Vec<Vec<f32>>,
}

impl PluginChain {
    pub fn new(channels: usize, frames: usize) -> PluginChain {
        PluginChain {
            plugins: vec![],
            channels,
            frames,
            buf_a: vec![vec![0.0; frames]; channels],
            buf_b: vec![vec![0.0; frames]; channels],
        }
    }
    /// plugins run in append order.  Channel counts must match the chain.
    pub fn append(&mut self, plugin: BoxedPlugin) -> Result<(), String> {
        if plugin.num_inputs() != self.channels || plugin.num_outputs() != self.channels {
            return Err(format!(
                "plugin wants {} in / {} out but the chain runs {} channels",
                plugin.num_inputs(),
                plugin.num_outputs(),
                self.channels
            ));
        }
        self.plugins.push(plugin);
        Ok(())
    }
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
    pub fn len(&self) -> usize {
        self.plugins.len()
    }
    /// run the chain over `bufs` in place.  An empty chain is a pass
    /// through.  Outputs of one plugin feed the next in append order.
    pub fn run(&mut self, bufs: &mut [Vec<f32>]) -> () {
        if self.plugins.is_empty() {
            return;
        }
        for c in 0..self.channels {
            self.buf_a[c][..self.frames].copy_from_slice(&bufs[c][..self.frames]);
        }
        let mut i: usize = 0;
        for plugin in &mut self.plugins {
            if i % 2 == 0 {
                plugin.compute(self.frames, &self.buf_a, &mut self.buf_b);
            } else {
                plugin.compute(self.frames, &self.buf_b, &mut self.buf_a);
            }
            i += 1;
        }
        let last = if i % 2 == 0 { &self.buf_a } else { &self.buf_b };
        for c in 0..self.channels {
            bufs[c][..self.frames].copy_from_slice(&last[c][..self.frames]);
        }
    }
}

/// look ahead free limiter used to keep a hub mix out of the clip region.
///
/// Headroom scales with how many client streams will be summed downstream:
/// with n expected clients each stream gets 1/n of full scale before gain
/// reduction starts.
pub struct Limiter {
    channels: usize,
    ceiling: f64,
    detectors: Vec<PeakDetector>,
}

impl Limiter {
    pub fn new(channels: usize, expected_clients: usize, sample_rate: f64) -> Limiter {
        let clients = expected_clients.max(1);
        let mut detectors = vec![];
        for _ in 0..channels {
            detectors.push(PeakDetector::build(0.002, 0.2, sample_rate));
        }
        Limiter {
            channels,
            ceiling: 1.0 / clients as f64,
            detectors,
        }
    }
}

impl ProcessPlugin for Limiter {
    fn num_inputs(&self) -> usize {
        self.channels
    }
    fn num_outputs(&self) -> usize {
        self.channels
    }
    fn compute(&mut self, frames: usize, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) -> () {
        for c in 0..self.channels {
            let det = &mut self.detectors[c];
            for j in 0..frames {
                let v = inputs[c][j];
                let env = det.get(f64::from(v.abs()));
                let gain = if env > self.ceiling {
                    self.ceiling / env
                } else {
                    1.0
                };
                outputs[c][j] = (f64::from(v) * gain) as f32;
            }
        }
    }
}

#[cfg(test)]
mod test_plugin {
    use super::*;

    struct Gain {
        channels: usize,
        gain: f32,
    }
    impl ProcessPlugin for Gain {
        fn num_inputs(&self) -> usize {
            self.channels
        }
        fn num_outputs(&self) -> usize {
            self.channels
        }
        fn compute(&mut self, frames: usize, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) -> () {
            for c in 0..self.channels {
                for j in 0..frames {
                    outputs[c][j] = inputs[c][j] * self.gain;
                }
            }
        }
    }

    #[test]
    fn empty_chain_is_pass_through() {
        let mut chain = PluginChain::new(2, 4);
        let mut bufs = vec![vec![0.5; 4], vec![-0.5; 4]];
        chain.run(&mut bufs);
        assert_eq!(bufs[0], vec![0.5; 4]);
        assert_eq!(bufs[1], vec![-0.5; 4]);
    }

    #[test]
    fn plugins_run_in_append_order() {
        // two gains chain multiplicatively
        let mut chain = PluginChain::new(1, 4);
        chain
            .append(Box::new(Gain {
                channels: 1,
                gain: 0.5,
            }))
            .unwrap();
        chain
            .append(Box::new(Gain {
                channels: 1,
                gain: 0.5,
            }))
            .unwrap();
        assert_eq!(chain.len(), 2);
        let mut bufs = vec![vec![1.0; 4]];
        chain.run(&mut bufs);
        assert_eq!(bufs[0], vec![0.25; 4]);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let mut chain = PluginChain::new(2, 4);
        let res = chain.append(Box::new(Gain {
            channels: 1,
            gain: 1.0,
        }));
        assert!(res.is_err());
    }

    #[test]
    fn limiter_passes_quiet_audio() {
        let mut lim = Limiter::new(1, 1, 48000.0);
        let inputs = vec![vec![0.1; 64]];
        let mut outputs = vec![vec![0.0; 64]];
        lim.compute(64, &inputs, &mut outputs);
        for j in 0..64 {
            assert!((outputs[0][j] - 0.1).abs() < 1e-6);
        }
    }

    #[test]
    fn limiter_pulls_down_hot_audio() {
        // with 4 expected clients the ceiling is 0.25 of full scale
        let mut lim = Limiter::new(1, 4, 48000.0);
        let inputs = vec![vec![1.0; 4800]];
        let mut outputs = vec![vec![0.0; 4800]];
        lim.compute(4800, &inputs, &mut outputs);
        // after the attack settles the output sits near the ceiling
        let tail = outputs[0][4799];
        assert!(tail < 0.5, "limiter let {} through", tail);
    }
}
