use log::debug;
use std::sync::Arc;

use super::ModeContext;
use crate::assets::ImageAsset;
use crate::frame::Frame;

/// Scans the uploaded image one column per tick, top row on pixel 0
#[derive(Default)]
pub struct ImageMode {
    image: Option<Arc<ImageAsset>>,
    generation: u64,
    column: usize,
}

impl ImageMode {
    pub(super) fn run(&mut self, ctx: &ModeContext) -> Frame {
        if let Some((generation, image)) = ctx.assets.image_since(self.generation) {
            debug!("Swapping in image generation {}", generation);
            self.generation = generation;
            self.image = image;
            self.column = 0;
        }

        let Some(image) = self.image.as_ref() else {
            return Frame::blank(ctx.num_pixels);
        };

        let frame = column_frame(image, self.column, ctx.num_pixels);
        let step = ctx.settings.image_columns_per_tick.max(1);
        self.column = (self.column + step) % image.width;
        frame
    }

    pub(super) fn release(&mut self) {
        self.image = None;
    }
}

/// One image column resampled to `num_pixels` rows (nearest neighbour)
fn column_frame(image: &ImageAsset, column: usize, num_pixels: usize) -> Frame {
    let mut frame = Frame::blank(num_pixels);
    for pixel in 0..num_pixels {
        let row = pixel * image.height / num_pixels;
        frame.set(pixel, image.pixel(column, row));
    }
    frame
}
