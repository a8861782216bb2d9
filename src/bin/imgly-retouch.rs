//! IMG.LY Retouch server
//!
//! HTTP service for inpainting, outpainting and background replacement backed by
//! ONNX Runtime models.

use imgly_retouch::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}
