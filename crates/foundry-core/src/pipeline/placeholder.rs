//! Terminal pipeline step. Cannot fail and does no I/O.

use image::{Rgba, RgbaImage};

use crate::domain::{AssetKind, TargetSize};

pub const PROVIDER: &str = "placeholder";

fn color(kind: AssetKind) -> Rgba<u8> {
    let [r, g, b] = match kind {
        AssetKind::Character => [100, 149, 237], // cornflower blue
        AssetKind::Background => [135, 206, 235], // sky blue
        AssetKind::Ui => [169, 169, 169],
        AssetKind::Icon => [255, 215, 0],
        AssetKind::General => [144, 238, 144],
    };
    Rgba([r, g, b, 255])
}

pub fn render(kind: AssetKind, size: TargetSize) -> RgbaImage {
    RgbaImage::from_pixel(size.width, size.height, color(kind))
}
