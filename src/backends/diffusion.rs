//! Diffusion inpainting (SDXL) on ONNX Runtime
//!
//! The model is an exported bundle directory:
//!
//! | File | Contents |
//! |---|---|
//! | `vae_encoder.onnx` | `[1, 3, H, W]` in `[-1, 1]` to `[1, 4, H/8, W/8]` latents |
//! | `unet.onnx` | 9-channel inpainting UNet (`sample`, `timestep`, `encoder_hidden_states`, `text_embeds`, `time_ids`) |
//! | `vae_decoder.onnx` | latents to `[1, 3, H, W]` in `[-1, 1]` |
//! | `prompt_embeds.bin` | `[2, 77, 2048]` little-endian f32, negative prompt first |
//! | `pooled_prompt_embeds.bin` | `[2, 1280]` little-endian f32, negative prompt first |
//!
//! Prompt embeddings are precomputed for [`DiffusionParams::PROMPT`] and
//! [`DiffusionParams::NEGATIVE_PROMPT`], so no text encoder runs at request time.

use crate::backends::onnx::{build_session, inference_failure, to_tensor, value_to_array4};
use crate::config::Device;
use crate::error::{RetouchError, Result};
use crate::inference::InpaintBackend;
use crate::models::ModelId;
use crate::utils::geometry::MASK_THRESHOLD;
use crate::utils::ImagePreprocessor;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use ndarray::{concatenate, s, Array1, Array2, Array3, Array4, Axis};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use rand::Rng;
use std::path::{Path, PathBuf};

/// Native working resolution
pub const DIFFUSION_SIZE: u32 = 1024;
/// VAE latent scaling factor for SDXL
pub const VAE_SCALING_FACTOR: f32 = 0.130_25;

const TEXT_SEQ_LEN: usize = 77;
const TEXT_HIDDEN: usize = 2048;
const POOLED_DIM: usize = 1280;
const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.000_85;
const BETA_END: f64 = 0.012;

/// Fixed generation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionParams {
    pub strength: f32,
    pub guidance_scale: f32,
    pub steps: usize,
}

impl DiffusionParams {
    pub const PROMPT: &'static str = "high quality, photorealistic, seamless, natural background";
    pub const NEGATIVE_PROMPT: &'static str =
        "blurry, artifacts, distorted, watermark, text, low quality";
}

impl Default for DiffusionParams {
    fn default() -> Self {
        Self {
            strength: 0.99,
            guidance_scale: 8.0,
            steps: 20,
        }
    }
}

/// File locations of a diffusion bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffusionBundle {
    pub vae_encoder: PathBuf,
    pub unet: PathBuf,
    pub vae_decoder: PathBuf,
    pub prompt_embeds: PathBuf,
    pub pooled_prompt_embeds: PathBuf,
}

impl DiffusionBundle {
    /// Locate every bundle file under `dir`
    ///
    /// # Errors
    /// - `dir` is not a directory or a bundle file is missing
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(RetouchError::invalid_config(format!(
                "Diffusion bundle '{}' is not a directory",
                dir.display()
            )));
        }

        let bundle = Self {
            vae_encoder: dir.join("vae_encoder.onnx"),
            unet: dir.join("unet.onnx"),
            vae_decoder: dir.join("vae_decoder.onnx"),
            prompt_embeds: dir.join("prompt_embeds.bin"),
            pooled_prompt_embeds: dir.join("pooled_prompt_embeds.bin"),
        };

        for path in [
            &bundle.vae_encoder,
            &bundle.unet,
            &bundle.vae_decoder,
            &bundle.prompt_embeds,
            &bundle.pooled_prompt_embeds,
        ] {
            if !path.is_file() {
                return Err(RetouchError::invalid_config(format!(
                    "Diffusion bundle is missing '{}'",
                    path.display()
                )));
            }
        }

        Ok(bundle)
    }
}

/// Read a raw little-endian f32 file holding exactly `expected_len` values
fn read_f32_file(path: &Path, expected_len: usize) -> Result<Vec<f32>> {
    let bytes =
        std::fs::read(path).map_err(|e| RetouchError::file_io_error("read embeddings", path, &e))?;

    if bytes.len() != expected_len * 4 {
        return Err(RetouchError::model(format!(
            "'{}' holds {} bytes, expected {}",
            path.display(),
            bytes.len(),
            expected_len * 4
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .filter_map(|c| <[u8; 4]>::try_from(c).ok())
        .map(f32::from_le_bytes)
        .collect())
}

/// Euler discrete noise schedule with "leading" timestep spacing
#[derive(Debug, Clone, PartialEq)]
pub struct EulerSchedule {
    /// Timesteps actually run, highest noise first
    pub timesteps: Vec<f32>,
    /// Sigma per timestep plus a trailing zero
    pub sigmas: Vec<f32>,
}

impl EulerSchedule {
    /// Build the truncated schedule for `steps` inference steps at `strength`
    #[must_use]
    pub fn new(steps: usize, strength: f32) -> Self {
        let steps = steps.max(1);

        // Scaled-linear betas
        let (sqrt_start, sqrt_end) = (BETA_START.sqrt(), BETA_END.sqrt());
        let mut alpha_cumprod = 1.0f64;
        let train_sigmas: Vec<f64> = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let t = i as f64 / (TRAIN_TIMESTEPS - 1) as f64;
                let beta = (sqrt_start + t * (sqrt_end - sqrt_start)).powi(2);
                alpha_cumprod *= 1.0 - beta;
                ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
            })
            .collect();

        let step_ratio = TRAIN_TIMESTEPS / steps;
        let all_timesteps: Vec<usize> = (0..steps)
            .rev()
            .map(|i| (i * step_ratio + 1).min(TRAIN_TIMESTEPS - 1))
            .collect();

        let init_steps = ((steps as f32 * strength) as usize).min(steps);
        let start = steps - init_steps;

        let timesteps: Vec<f32> = all_timesteps.iter().skip(start).map(|&t| t as f32).collect();
        let mut sigmas: Vec<f32> = all_timesteps
            .iter()
            .skip(start)
            .map(|&t| train_sigmas.get(t).copied().unwrap_or(0.0) as f32)
            .collect();
        sigmas.push(0.0);

        Self { timesteps, sigmas }
    }

    /// Sigma of the first step, used to noise the initial latents
    #[must_use]
    pub fn initial_sigma(&self) -> f32 {
        self.sigmas.first().copied().unwrap_or(0.0)
    }
}

/// Diffusion inpainting backend
pub struct DiffusionBackend {
    vae_encoder: Session,
    unet: Session,
    vae_decoder: Session,
    prompt_embeds: Array3<f32>,
    pooled_prompt_embeds: Array2<f32>,
    timestep_is_int: bool,
    device: Device,
    params: DiffusionParams,
}

impl std::fmt::Debug for DiffusionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffusionBackend")
            .field("device", &self.device)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl DiffusionBackend {
    /// Load every graph in the bundle on `device`
    ///
    /// # Errors
    /// - Missing bundle files
    /// - Session creation failures
    /// - Embedding files of the wrong size
    pub fn load(dir: &Path, device: Device, intra_threads: usize) -> Result<Self> {
        let bundle = DiffusionBundle::open(dir)?;

        let prompt_embeds = Array3::from_shape_vec(
            (2, TEXT_SEQ_LEN, TEXT_HIDDEN),
            read_f32_file(&bundle.prompt_embeds, 2 * TEXT_SEQ_LEN * TEXT_HIDDEN)?,
        )
        .map_err(|e| RetouchError::model(format!("Invalid prompt embeddings: {e}")))?;
        let pooled_prompt_embeds = Array2::from_shape_vec(
            (2, POOLED_DIM),
            read_f32_file(&bundle.pooled_prompt_embeds, 2 * POOLED_DIM)?,
        )
        .map_err(|e| RetouchError::model(format!("Invalid pooled embeddings: {e}")))?;

        let vae_encoder = build_session(&bundle.vae_encoder, device, intra_threads, "SDXL VAE encoder")?;
        let unet = build_session(&bundle.unet, device, intra_threads, "SDXL UNet")?;
        let vae_decoder = build_session(&bundle.vae_decoder, device, intra_threads, "SDXL VAE decoder")?;

        let timestep_is_int = unet
            .inputs
            .iter()
            .find(|input| input.name == "timestep")
            .is_some_and(|input| {
                matches!(
                    input.input_type,
                    ValueType::Tensor {
                        ty: TensorElementType::Int64,
                        ..
                    }
                )
            });

        Ok(Self {
            vae_encoder,
            unet,
            vae_decoder,
            prompt_embeds,
            pooled_prompt_embeds,
            timestep_is_int,
            device,
            params: DiffusionParams::default(),
        })
    }

    fn encode(&mut self, pixels: Array4<f32>) -> Result<Array4<f32>> {
        let outputs = self
            .vae_encoder
            .run(ort::inputs![to_tensor(pixels)?])
            .map_err(|e| inference_failure(self.device, "SDXL VAE encode", &e))?;
        Ok(value_to_array4(&outputs[0])? * VAE_SCALING_FACTOR)
    }

    fn decode(&mut self, latents: &Array4<f32>) -> Result<Array4<f32>> {
        let scaled = latents / VAE_SCALING_FACTOR;
        let outputs = self
            .vae_decoder
            .run(ort::inputs![to_tensor(scaled)?])
            .map_err(|e| inference_failure(self.device, "SDXL VAE decode", &e))?;
        value_to_array4(&outputs[0])
    }

    fn predict_noise(
        &mut self,
        model_input: Array4<f32>,
        timestep: f32,
        time_ids: &Array2<f32>,
    ) -> Result<Array4<f32>> {
        let sample = to_tensor(model_input)?;
        let hidden = Tensor::from_array(self.prompt_embeds.clone())
            .map_err(|e| RetouchError::processing(format!("Failed to convert embeddings: {e}")))?;
        let text_embeds = Tensor::from_array(self.pooled_prompt_embeds.clone())
            .map_err(|e| RetouchError::processing(format!("Failed to convert embeddings: {e}")))?;
        let time_ids = Tensor::from_array(time_ids.clone())
            .map_err(|e| RetouchError::processing(format!("Failed to convert time ids: {e}")))?;

        let outputs = if self.timestep_is_int {
            let timestep = Tensor::from_array(Array1::from_elem(1, timestep as i64))
                .map_err(|e| RetouchError::processing(format!("Failed to convert timestep: {e}")))?;
            self.unet.run(ort::inputs![
                "sample" => sample,
                "timestep" => timestep,
                "encoder_hidden_states" => hidden,
                "text_embeds" => text_embeds,
                "time_ids" => time_ids,
            ])
        } else {
            let timestep = Tensor::from_array(Array1::from_elem(1, timestep))
                .map_err(|e| RetouchError::processing(format!("Failed to convert timestep: {e}")))?;
            self.unet.run(ort::inputs![
                "sample" => sample,
                "timestep" => timestep,
                "encoder_hidden_states" => hidden,
                "text_embeds" => text_embeds,
                "time_ids" => time_ids,
            ])
        }
        .map_err(|e| inference_failure(self.device, "SDXL UNet", &e))?;

        value_to_array4(&outputs[0])
    }
}

/// Scale `[0, 1]` pixels to the VAE's `[-1, 1]` range
fn to_signed(tensor: Array4<f32>) -> Array4<f32> {
    tensor.mapv(|v| v * 2.0 - 1.0)
}

/// Standard normal noise via Box-Muller
fn gaussian_noise(shape: (usize, usize, usize, usize)) -> Array4<f32> {
    let mut rng = rand::rng();
    Array4::from_shape_simple_fn(shape, || {
        let u1: f32 = rng.random::<f32>().max(f32::MIN_POSITIVE);
        let u2: f32 = rng.random::<f32>();
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    })
}

impl InpaintBackend for DiffusionBackend {
    fn model_id(&self) -> ModelId {
        ModelId::Sdxl
    }

    fn device(&self) -> Device {
        self.device
    }

    fn inpaint(&mut self, image: &RgbImage, mask: &GrayImage) -> Result<RgbImage> {
        if image.dimensions() != mask.dimensions() {
            return Err(RetouchError::processing(format!(
                "Mask {:?} does not match image {:?}",
                mask.dimensions(),
                image.dimensions()
            )));
        }
        let (width, height) = image.dimensions();
        let params = self.params;

        let work_image = imageops::resize(image, DIFFUSION_SIZE, DIFFUSION_SIZE, FilterType::Lanczos3);
        let work_mask = imageops::resize(mask, DIFFUSION_SIZE, DIFFUSION_SIZE, FilterType::Nearest);

        let pixels = to_signed(ImagePreprocessor::unit_tensor(&work_image));
        let pixel_mask = ImagePreprocessor::mask_tensor(&work_mask);
        let masked_pixels = &pixels * &pixel_mask.mapv(|m| 1.0 - m);

        let image_latents = self.encode(pixels)?;
        let masked_latents = self.encode(masked_pixels)?;

        let latent_side = DIFFUSION_SIZE / 8;
        let latent_mask = ImagePreprocessor::mask_tensor(&imageops::resize(
            &work_mask,
            latent_side,
            latent_side,
            FilterType::Nearest,
        ));

        let schedule = EulerSchedule::new(params.steps, params.strength);
        let noise = gaussian_noise(image_latents.dim());
        let mut latents = &image_latents + &(noise * schedule.initial_sigma());

        let size = DIFFUSION_SIZE as f32;
        let time_ids = Array2::from_shape_vec(
            (2, 6),
            [size, size, 0.0, 0.0, size, size].repeat(2),
        )
        .map_err(|e| RetouchError::processing(format!("Invalid time ids: {e}")))?;

        // Classifier-free guidance batch: [unconditional, conditional]
        let mask_batch = concatenate(Axis(0), &[latent_mask.view(), latent_mask.view()])
            .map_err(|e| RetouchError::processing(format!("Mask batch: {e}")))?;
        let masked_batch = concatenate(Axis(0), &[masked_latents.view(), masked_latents.view()])
            .map_err(|e| RetouchError::processing(format!("Masked latent batch: {e}")))?;

        for (index, &timestep) in schedule.timesteps.iter().enumerate() {
            let sigma = schedule.sigmas.get(index).copied().unwrap_or(0.0);
            let sigma_next = schedule.sigmas.get(index + 1).copied().unwrap_or(0.0);

            let scaled = &latents / (sigma * sigma + 1.0).sqrt();
            let latent_batch = concatenate(Axis(0), &[scaled.view(), scaled.view()])
                .map_err(|e| RetouchError::processing(format!("Latent batch: {e}")))?;
            let model_input = concatenate(
                Axis(1),
                &[latent_batch.view(), mask_batch.view(), masked_batch.view()],
            )
            .map_err(|e| RetouchError::processing(format!("UNet input: {e}")))?;

            let noise_pred = self.predict_noise(model_input, timestep, &time_ids)?;
            let uncond = noise_pred.slice(s![0..1, .., .., ..]);
            let cond = noise_pred.slice(s![1..2, .., .., ..]);
            let guided = &uncond + &((&cond - &uncond) * params.guidance_scale);

            // Euler step: derivative equals the predicted noise for epsilon models
            latents = &latents + &(guided * (sigma_next - sigma));
            log::debug!("SDXL step {}/{} (t={})", index + 1, schedule.timesteps.len(), timestep);
        }

        let decoded = self.decode(&latents)?.mapv(|v| (v + 1.0) / 2.0);
        let generated = ImagePreprocessor::tensor_to_rgb(&decoded)?;
        let generated = imageops::resize(&generated, width, height, FilterType::Lanczos3);

        let mut result = image.clone();
        for (x, y, pixel) in result.enumerate_pixels_mut() {
            if mask.get_pixel(x, y).0[0] > MASK_THRESHOLD {
                *pixel = *generated.get_pixel(x, y);
            }
        }

        Ok(result)
    }
}
