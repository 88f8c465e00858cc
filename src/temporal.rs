//! Key layout of the temporal (motion) layers
//!
//! A motion module only carries the temporal transformer weights that sit
//! after every spatial block of the denoiser. Their names and shapes follow
//! from the spatial layout plus [`MotionModuleConfig`], so the denoiser's key
//! space can be declared up front and a motion checkpoint checked against it
//! before anything is written.
//!
//! Per motion module, with `C` channels, attention width
//! `D = heads * (C / heads / temporal_attention_dim_div)` and prefix
//! `{block}.motion_modules.{j}.temporal_transformer`:
//!
//! ```text
//! norm.{weight,bias}                               [C]
//! proj_in.weight [D, C]          proj_in.bias      [D]
//! transformer_blocks.{t}.attention_blocks.{a}.to_{q,k,v}.weight   [D, D]
//! transformer_blocks.{t}.attention_blocks.{a}.to_out.0.{weight,bias}
//! transformer_blocks.{t}.attention_blocks.{a}.pos_encoder.pe      [1, max_len, D]
//! transformer_blocks.{t}.norms.{a}.{weight,bias}   [D]
//! transformer_blocks.{t}.ff.net.0.proj.{weight,bias}  [8C, D] / [8C]
//! transformer_blocks.{t}.ff.net.2.{weight,bias}       [D, 4C] / [D]
//! transformer_blocks.{t}.ff_norm.{weight,bias}     [D]
//! proj_out.weight [C, D]         proj_out.bias     [C]
//! ```

use crate::config::{DenoiserLayoutConfig, MotionModuleConfig};
use crate::weights::{ModuleWeights, Result};
use candle_core::Shape;
use tracing::debug;

/// One declared temporal parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalParam {
    pub name: String,
    pub shape: Vec<usize>,
}

impl TemporalParam {
    fn new(name: String, shape: &[usize]) -> Self {
        Self {
            name,
            shape: shape.to_vec(),
        }
    }
}

/// All temporal parameters the denoiser exposes for `motion`
pub fn temporal_layout(denoiser: &DenoiserLayoutConfig, motion: &MotionModuleConfig) -> Vec<TemporalParam> {
    let mut params = Vec::new();
    if !motion.use_motion_module {
        return params;
    }

    let channels = &denoiser.block_out_channels;
    let num_blocks = channels.len();

    // Block i of the down path runs at resolution 2^i; the up path mirrors it.
    if !motion.motion_module_decoder_only {
        for (i, &c) in channels.iter().enumerate() {
            if motion.motion_module_resolutions.contains(&(1 << i)) {
                for j in 0..denoiser.layers_per_block {
                    push_module(&mut params, &format!("down_blocks.{i}.motion_modules.{j}"), c, motion);
                }
            }
        }
    }

    if motion.motion_module_mid_block {
        if let Some(&c) = channels.last() {
            push_module(&mut params, "mid_block.motion_modules.0", c, motion);
        }
    }

    for i in 0..num_blocks {
        let resolution = 1 << (num_blocks - 1 - i);
        if !motion.motion_module_resolutions.contains(&resolution) {
            continue;
        }
        let c = channels[num_blocks - 1 - i];
        for j in 0..=denoiser.layers_per_block {
            push_module(&mut params, &format!("up_blocks.{i}.motion_modules.{j}"), c, motion);
        }
    }

    params
}

fn push_module(params: &mut Vec<TemporalParam>, module: &str, c: usize, motion: &MotionModuleConfig) {
    // Whole heads only; the per-head width is what the divisor shrinks
    let heads = motion.num_attention_heads.max(1);
    let inner = heads * (c / heads / motion.temporal_attention_dim_div.max(1));
    let ff_inner = c * 4;
    let root = format!("{module}.temporal_transformer");

    params.push(TemporalParam::new(format!("{root}.norm.weight"), &[c]));
    params.push(TemporalParam::new(format!("{root}.norm.bias"), &[c]));
    params.push(TemporalParam::new(format!("{root}.proj_in.weight"), &[inner, c]));
    params.push(TemporalParam::new(format!("{root}.proj_in.bias"), &[inner]));

    for t in 0..motion.num_transformer_block {
        let block = format!("{root}.transformer_blocks.{t}");
        for a in 0..motion.attention_block_types.len() {
            let attn = format!("{block}.attention_blocks.{a}");
            params.push(TemporalParam::new(format!("{attn}.to_q.weight"), &[inner, inner]));
            params.push(TemporalParam::new(format!("{attn}.to_k.weight"), &[inner, inner]));
            params.push(TemporalParam::new(format!("{attn}.to_v.weight"), &[inner, inner]));
            params.push(TemporalParam::new(format!("{attn}.to_out.0.weight"), &[inner, inner]));
            params.push(TemporalParam::new(format!("{attn}.to_out.0.bias"), &[inner]));
            if motion.temporal_position_encoding {
                params.push(TemporalParam::new(
                    format!("{attn}.pos_encoder.pe"),
                    &[1, motion.temporal_position_encoding_max_len, inner],
                ));
            }
            params.push(TemporalParam::new(format!("{block}.norms.{a}.weight"), &[inner]));
            params.push(TemporalParam::new(format!("{block}.norms.{a}.bias"), &[inner]));
        }
        // GEGLU projects to twice the hidden width
        params.push(TemporalParam::new(format!("{block}.ff.net.0.proj.weight"), &[ff_inner * 2, inner]));
        params.push(TemporalParam::new(format!("{block}.ff.net.0.proj.bias"), &[ff_inner * 2]));
        params.push(TemporalParam::new(format!("{block}.ff.net.2.weight"), &[inner, ff_inner]));
        params.push(TemporalParam::new(format!("{block}.ff.net.2.bias"), &[inner]));
        params.push(TemporalParam::new(format!("{block}.ff_norm.weight"), &[inner]));
        params.push(TemporalParam::new(format!("{block}.ff_norm.bias"), &[inner]));
    }

    params.push(TemporalParam::new(format!("{root}.proj_out.weight"), &[c, inner]));
    params.push(TemporalParam::new(format!("{root}.proj_out.bias"), &[c]));
}

/// Declare the temporal parameters on `denoiser`, zero-initialized
///
/// Returns the number of newly declared parameters.
pub fn declare_temporal_layers(
    denoiser: &mut ModuleWeights,
    layout: &DenoiserLayoutConfig,
    motion: &MotionModuleConfig,
) -> Result<usize> {
    let mut declared = 0;
    for param in temporal_layout(layout, motion) {
        if denoiser.declare(param.name, Shape::from(param.shape))? {
            declared += 1;
        }
    }
    debug!(declared, total = denoiser.len(), "Declared temporal layers");
    Ok(declared)
}
