//! Example gallery
//!
//! Known-good combinations of base model, motion module and prompt. Seeds are
//! kept as text because several exceed `i64::MAX` and go through the same
//! parsing path as user input.

use crate::config::ConfigError;
use crate::generate::{GenerationRequest, SeedRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub base_model: &'static str,
    pub motion_module: &'static str,
    pub prompt: &'static str,
    pub negative_prompt: &'static str,
    pub width: usize,
    pub height: usize,
    pub seed: &'static str,
}

impl Preset {
    /// Build a request with the preset's prompt, size and seed
    pub fn request(&self) -> Result<GenerationRequest, ConfigError> {
        let seed: SeedRequest = self.seed.parse()?;
        Ok(GenerationRequest {
            prompt: self.prompt.to_string(),
            negative_prompt: self.negative_prompt.to_string(),
            width: self.width,
            height: self.height,
            seed,
            ..Default::default()
        })
    }
}

const GALLERY: [Preset; 3] = [
    Preset {
        name: "ToonYou",
        base_model: "toonyou_beta3.safetensors",
        motion_module: "mm_sd_v14.ckpt",
        prompt: "masterpiece, best quality, 1girl, solo, cherry blossoms, hanami, pink flower, white flower, spring season, wisteria, petals, flower, plum blossoms, outdoors, falling petals, white hair, black eyes",
        negative_prompt: "worst quality, low quality, nsfw, logo",
        width: 512,
        height: 512,
        seed: "13204175718326964000",
    },
    Preset {
        name: "Lyriel",
        base_model: "lyriel_v16.safetensors",
        motion_module: "mm_sd_v15.ckpt",
        prompt: "A forbidden castle high up in the mountains, pixel art, intricate details2, hdr, intricate details, hyperdetailed5, natural skin texture, hyperrealism, soft light, sharp, game art, key visual, surreal",
        negative_prompt: "3d, cartoon, anime, sketches, worst quality, low quality, normal quality, lowres, normal quality, monochrome, grayscale, skin spots, acnes, skin blemishes, bad anatomy, girl, loli, young, large breasts, red eyes, muscular",
        width: 512,
        height: 512,
        seed: "6681501646976930000",
    },
    Preset {
        name: "RCNZ",
        base_model: "rcnzCartoon3d_v10.safetensors",
        motion_module: "mm_sd_v15.ckpt",
        prompt: "Jane Eyre with headphones, natural skin texture,4mm,k textures, soft cinematic light, adobe lightroom, photolab, hdr, intricate, elegant, highly detailed, sharp focus, cinematic look, soothing tones, insane details, intricate details, hyperdetailed, low contrast, soft cinematic light, dim colors, exposure blend, hdr, faded",
        negative_prompt: "deformed, distorted, disfigured, poorly drawn, bad anatomy, wrong anatomy, extra limb, missing limb, floating limbs, mutated hands and fingers, disconnected limbs, mutation, mutated, ugly, disgusting, blurry, amputation",
        width: 512,
        height: 512,
        seed: "5787693165787021000",
    },
];

pub fn gallery() -> &'static [Preset] {
    &GALLERY
}

/// Look a preset up by 1-based index or case-insensitive name
pub fn find(key: &str) -> Option<&'static Preset> {
    if let Ok(index) = key.parse::<usize>() {
        return index.checked_sub(1).and_then(|i| GALLERY.get(i));
    }
    GALLERY.iter().find(|p| p.name.eq_ignore_ascii_case(key))
}
