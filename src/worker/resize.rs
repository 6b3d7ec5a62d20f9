use image::imageops::FilterType;

use super::handlers::{load_file, load_image};
use super::JobError;
use crate::app_state::AppState;
use crate::db::files;
use crate::services::tiler;

/// Widths of the resized copies kept next to every original.
pub const RESIZE_WIDTHS: [u32; 3] = [1024, 512, 128];

/// Widths worth producing for a source image; never upscale.
pub fn target_widths(source_width: u32) -> Vec<u32> {
    RESIZE_WIDTHS.iter().copied().filter(|w| *w < source_width).collect()
}

pub async fn resize_file(state: &AppState, file_id: i64) -> Result<(), JobError> {
    let file = load_file(state, file_id).await?;
    let image = load_image(state, &file).await?;
    let widths = target_widths(image.width());

    let encoded = tokio::task::spawn_blocking(move || {
        widths
            .into_iter()
            .map(|w| {
                let resized = image.resize(w, u32::MAX, FilterType::Lanczos3);
                tiler::encode_jpeg(&resized).map(|jpeg| (w, jpeg))
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .await??;

    for (width, jpeg) in &encoded {
        state
            .storage
            .upload(&file.resized_key(*width), jpeg, "image/jpeg")
            .await?;
        files::insert_resized(&state.db, file.id, file.user_id, *width as i32).await?;
        tracing::debug!(file_id = file.id, width, bytes = jpeg.len(), "Uploaded resized copy");
    }

    tracing::info!(file_id = file.id, copies = encoded.len(), "Resize complete");
    Ok(())
}
