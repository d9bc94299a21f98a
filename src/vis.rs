// vis.rs - Attachment preparation for the vision model
//
// Reads an archived attachment from disk, converts GIFs to PNG (first frame)
// for vision model compatibility, and encodes the bytes as a base64 data URI
// inside a multimodal chat message.

use crate::error::DigestResult;
use crate::lm::{ImageUrl, MessageContent, MultimodalChatMessage};
use crate::observe::Observer;
use base64::{engine::general_purpose, Engine as _};
use image::ImageFormat;
use log::debug;
use std::io::Cursor;
use std::path::Path;

/// Returns (base64_image, content_type) for a local attachment.
pub async fn load_image_for_vision(path: &Path, observer: &Observer) -> DigestResult<(String, String)> {
    let bytes = tokio::fs::read(path).await?;
    debug!(target: observer.target(), "🖼️ Loaded attachment {} ({} bytes)", path.display(), bytes.len());

    let content_type = mime_guess::from_path(path)
        .first_or(mime_guess::mime::IMAGE_JPEG)
        .to_string();

    let (processed, final_content_type) = if is_gif(path, &content_type) {
        match gif_to_png(&bytes) {
            Ok(png) => (png, "image/png".to_string()),
            Err(e) => {
                debug!(target: observer.target(), "🖼️ GIF conversion failed for {}, sending raw bytes: {}", path.display(), e);
                (bytes, content_type)
            }
        }
    } else {
        (bytes, content_type)
    };

    Ok((general_purpose::STANDARD.encode(&processed), final_content_type))
}

fn is_gif(path: &Path, content_type: &str) -> bool {
    content_type == "image/gif"
        || path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gif"))
            .unwrap_or(false)
}

/// Decodes the first frame of a (possibly animated) GIF and re-encodes it as PNG.
fn gif_to_png(gif_bytes: &[u8]) -> DigestResult<Vec<u8>> {
    let img = image::load_from_memory_with_format(gif_bytes, ImageFormat::Gif)?;
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

pub fn create_vision_message(prompt: &str, base64_image: &str, content_type: &str) -> Vec<MultimodalChatMessage> {
    vec![
        MultimodalChatMessage {
            role: "system".to_string(),
            content: vec![MessageContent::Text {
                content_type: "text".to_string(),
                text: "You are a vision-capable AI assistant describing images shared in a group chat.".to_string(),
            }],
        },
        MultimodalChatMessage {
            role: "user".to_string(),
            content: vec![
                MessageContent::Text {
                    content_type: "text".to_string(),
                    text: prompt.to_string(),
                },
                MessageContent::Image {
                    content_type: "image_url".to_string(),
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", content_type, base64_image),
                    },
                },
            ],
        },
    ]
}
