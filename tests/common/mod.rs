//! Shared on-disk fixtures: a tiny pretrained model directory, LDM base
//! models and motion modules, all small enough to load in milliseconds.

#![allow(dead_code)]

use candle_animate::config::{AnimateConfig, DenoiserLayoutConfig, InferenceConfig, MotionModuleConfig};
use candle_animate::temporal::temporal_layout;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

/// Value every pretrained tensor is filled with
pub const PRETRAINED: f32 = 0.1;

/// Creates a safetensors file with constant-filled f32 tensors
pub fn write_safetensors(path: &Path, tensors: &[(String, f32, Vec<usize>)]) {
    use safetensors::serialize;
    use safetensors::tensor::TensorView;

    let buffers: Vec<Vec<f32>> = tensors
        .iter()
        .map(|(_, value, shape)| vec![*value; shape.iter().product()])
        .collect();

    let views: Vec<(String, TensorView)> = tensors
        .iter()
        .zip(&buffers)
        .map(|((name, _, shape), data)| {
            let bytes = bytemuck::cast_slice(data);
            let view = TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes).unwrap();
            (name.clone(), view)
        })
        .collect();

    let data = serialize(views, &None).unwrap();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

/// Path of a checked-in file under `tests/fixtures`
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Temporal keys stored in the `.ckpt` fixtures
pub const CKPT_KEYS: [&str; 4] = [
    "down_blocks.0.motion_modules.0.temporal_transformer.norm.weight",
    "down_blocks.0.motion_modules.0.temporal_transformer.norm.bias",
    "down_blocks.0.motion_modules.0.temporal_transformer.proj_in.weight",
    "up_blocks.1.motion_modules.0.temporal_transformer.transformer_blocks.0.attention_blocks.0.pos_encoder.pe",
];

/// Creates a whitespace word-level tokenizer.json
pub fn write_tokenizer(path: &Path) {
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "<unk>": 0, "a": 1, "cat": 2, "dog": 3, "girl": 4,
                "blurry": 5, "low": 6, "quality": 7, "castle": 8, ",": 9
            },
            "unk_token": "<unk>"
        }
    });
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_string_pretty(&json).unwrap()).unwrap();
}

/// Two-level denoiser with one resnet per down block and small motion modules
pub fn tiny_inference() -> InferenceConfig {
    InferenceConfig {
        denoiser: DenoiserLayoutConfig {
            block_out_channels: vec![4, 8],
            layers_per_block: 1,
            vae_scale_factor: 8,
            latent_channels: 4,
        },
        motion_module: MotionModuleConfig {
            motion_module_resolutions: vec![1, 2],
            num_attention_heads: 1,
            temporal_position_encoding_max_len: 4,
            ..MotionModuleConfig::default()
        },
        ..InferenceConfig::default()
    }
}

fn spec(name: &str, value: f32, shape: &[usize]) -> (String, f32, Vec<usize>) {
    (name.to_string(), value, shape.to_vec())
}

/// Spatial keys of the pretrained modules, in diffusers layout
pub fn pretrained_autoencoder(value: f32) -> Vec<(String, f32, Vec<usize>)> {
    vec![
        spec("encoder.conv_in.weight", value, &[2, 3]),
        spec("encoder.conv_in.bias", value, &[2]),
        spec("decoder.mid_block.attentions.0.to_q.weight", value, &[2, 2]),
        spec("post_quant_conv.bias", value, &[2]),
    ]
}

pub fn pretrained_text_encoder(value: f32) -> Vec<(String, f32, Vec<usize>)> {
    vec![
        spec("text_model.embeddings.token_embedding.weight", value, &[10, 2]),
        spec("text_model.final_layer_norm.weight", value, &[2]),
    ]
}

pub fn pretrained_denoiser(value: f32) -> Vec<(String, f32, Vec<usize>)> {
    vec![
        spec("conv_in.weight", value, &[4, 4]),
        spec("conv_in.bias", value, &[4]),
        spec("time_embedding.linear_1.weight", value, &[4, 4]),
        spec("down_blocks.0.resnets.0.norm1.weight", value, &[4]),
        spec("conv_out.bias", value, &[4]),
    ]
}

/// The same weights in LDM layout, as a personalized base model ships them
pub fn ldm_base_model(value: f32) -> Vec<(String, f32, Vec<usize>)> {
    vec![
        spec("first_stage_model.encoder.conv_in.weight", value, &[2, 3]),
        spec("first_stage_model.encoder.conv_in.bias", value, &[2]),
        spec("first_stage_model.decoder.mid.attn_1.q.weight", value, &[2, 2, 1, 1]),
        spec("first_stage_model.post_quant_conv.bias", value, &[2]),
        spec("cond_stage_model.transformer.text_model.embeddings.token_embedding.weight", value, &[10, 2]),
        spec("cond_stage_model.transformer.final_layer_norm.weight", value, &[2]),
        spec("model.diffusion_model.input_blocks.0.0.weight", value, &[4, 4]),
        spec("model.diffusion_model.input_blocks.0.0.bias", value, &[4]),
        spec("model.diffusion_model.time_embed.0.weight", value, &[4, 4]),
        spec("model.diffusion_model.input_blocks.1.0.in_layers.0.weight", value, &[4]),
        spec("model.diffusion_model.out.2.bias", value, &[4]),
        // Training leftovers no module knows about
        spec("model_ema.decay", value, &[1]),
        spec("model.diffusion_model.label_emb.0.0.weight", value, &[4, 4]),
    ]
}

/// Every temporal parameter of `tiny_inference()`, filled with `value`
pub fn motion_module(value: f32) -> Vec<(String, f32, Vec<usize>)> {
    let inference = tiny_inference();
    temporal_layout(&inference.denoiser, &inference.motion_module)
        .into_iter()
        .map(|p| (p.name, value, p.shape))
        .collect()
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: AnimateConfig,
    pub inference: InferenceConfig,
}

impl Fixture {
    /// Models root with:
    /// - base models `alpha.safetensors` (1.0) and `beta.safetensors` (2.0)
    /// - motion modules `mm_a.safetensors` (0.5), `mm_b.safetensors` (0.25)
    ///   and `mm_bad.safetensors`, which carries a key outside the denoiser
    pub fn new() -> Self {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let mut config = AnimateConfig::from_models_root(root.join("models"), root.join("samples"));
        config.cpu = true;

        let inference = tiny_inference();
        let inference_path = root.join("inference.json");
        fs::write(&inference_path, serde_json::to_string_pretty(&inference).unwrap()).unwrap();
        config.inference_config = Some(inference_path);

        let pretrained = &config.pretrained_model_dir;
        write_safetensors(
            &pretrained.join("vae/diffusion_pytorch_model.safetensors"),
            &pretrained_autoencoder(PRETRAINED),
        );
        write_safetensors(
            &pretrained.join("text_encoder/model.safetensors"),
            &pretrained_text_encoder(PRETRAINED),
        );
        write_safetensors(
            &pretrained.join("unet/diffusion_pytorch_model.safetensors"),
            &pretrained_denoiser(PRETRAINED),
        );
        write_tokenizer(&pretrained.join("tokenizer/tokenizer.json"));

        write_safetensors(&config.base_model_dir.join("alpha.safetensors"), &ldm_base_model(1.0));
        write_safetensors(&config.base_model_dir.join("beta.safetensors"), &ldm_base_model(2.0));

        write_safetensors(&config.motion_module_dir.join("mm_a.safetensors"), &motion_module(0.5));
        write_safetensors(&config.motion_module_dir.join("mm_b.safetensors"), &motion_module(0.25));
        let mut bad = motion_module(0.75);
        bad.push(spec("down_blocks.0.motion_modules.7.temporal_transformer.norm.weight", 0.75, &[4]));
        write_safetensors(&config.motion_module_dir.join("mm_bad.safetensors"), &bad);

        Self {
            dir,
            config,
            inference,
        }
    }

    pub fn base_model_path(&self, name: &str) -> PathBuf {
        self.config.base_model_dir.join(name)
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }
}

/// All values of a tensor, flattened
pub fn values(tensor: &candle_core::Tensor) -> Vec<f32> {
    tensor
        .to_dtype(candle_core::DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}
