//! LDM UNet → diffusers denoiser keys

use super::{rename_prefix, replace_all, split_indexed};
use crate::loader::StateDict;
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub(super) const LDM_PREFIX: &str = "model.diffusion_model.";

const TOP_LEVEL: &[(&str, &str)] = &[
    ("time_embed.0.", "time_embedding.linear_1."),
    ("time_embed.2.", "time_embedding.linear_2."),
    ("input_blocks.0.0.", "conv_in."),
    ("out.0.", "conv_norm_out."),
    ("out.2.", "conv_out."),
];

const RESNET_RENAMES: &[(&str, &str)] = &[
    ("in_layers.0", "norm1"),
    ("in_layers.2", "conv1"),
    ("out_layers.0", "norm2"),
    ("out_layers.3", "conv2"),
    ("emb_layers.1", "time_emb_proj"),
    ("skip_connection", "conv_shortcut"),
];

pub(super) fn convert(raw: &StateDict, layers_per_block: usize) -> StateDict {
    let unet: BTreeMap<&str, _> = raw
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(LDM_PREFIX).map(|k| (k, v)))
        .collect();

    let upsamplers = upsampler_layers(unet.keys().copied());

    unet.into_iter()
        .filter_map(|(key, tensor)| {
            map_key(key, layers_per_block, &upsamplers).map(|k| (k, tensor.clone()))
        })
        .collect()
}

/// `output_blocks.i.j` layers that hold nothing but an upsampling conv
fn upsampler_layers<'a>(keys: impl Iterator<Item = &'a str>) -> HashSet<(usize, usize)> {
    let mut layers: BTreeMap<(usize, usize), BTreeSet<&str>> = BTreeMap::new();
    for key in keys {
        if let Some((idx, rest)) = split_indexed(key, "output_blocks", 2) {
            layers.entry((idx[0], idx[1])).or_default().insert(rest);
        }
    }

    let conv: BTreeSet<&str> = ["conv.bias", "conv.weight"].into_iter().collect();
    layers
        .into_iter()
        .filter(|((_, j), names)| *j > 0 && *names == conv)
        .map(|(layer, _)| layer)
        .collect()
}

fn map_key(
    key: &str,
    layers_per_block: usize,
    upsamplers: &HashSet<(usize, usize)>,
) -> Option<String> {
    if let Some(mapped) = rename_prefix(TOP_LEVEL, key) {
        return Some(mapped);
    }

    let per_block = layers_per_block + 1;

    if let Some((idx, rest)) = split_indexed(key, "input_blocks", 2) {
        let (i, j) = (idx[0], idx[1]);
        if i == 0 {
            return None;
        }
        let block = (i - 1) / per_block;
        let layer = (i - 1) % per_block;
        return match j {
            0 => match rest.strip_prefix("op.") {
                Some(param) => Some(format!("down_blocks.{block}.downsamplers.0.conv.{param}")),
                None => Some(format!(
                    "down_blocks.{block}.resnets.{layer}.{}",
                    replace_all(RESNET_RENAMES, rest)
                )),
            },
            1 => Some(format!("down_blocks.{block}.attentions.{layer}.{rest}")),
            _ => None,
        };
    }

    if let Some((idx, rest)) = split_indexed(key, "middle_block", 1) {
        return match idx[0] {
            0 => Some(format!("mid_block.resnets.0.{}", replace_all(RESNET_RENAMES, rest))),
            1 => Some(format!("mid_block.attentions.0.{rest}")),
            2 => Some(format!("mid_block.resnets.1.{}", replace_all(RESNET_RENAMES, rest))),
            _ => None,
        };
    }

    if let Some((idx, rest)) = split_indexed(key, "output_blocks", 2) {
        let (i, j) = (idx[0], idx[1]);
        let block = i / per_block;
        let layer = i % per_block;
        if upsamplers.contains(&(i, j)) {
            return Some(format!("up_blocks.{block}.upsamplers.0.{rest}"));
        }
        return match j {
            0 => Some(format!(
                "up_blocks.{block}.resnets.{layer}.{}",
                replace_all(RESNET_RENAMES, rest)
            )),
            1 => Some(format!("up_blocks.{block}.attentions.{layer}.{rest}")),
            _ => None,
        };
    }

    None
}
