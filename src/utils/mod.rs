use image::{DynamicImage, GrayImage, Rgb, RgbImage};

/// Tiles `count` CHW images in `[-1, 1]` into one image, `columns` tiles per row with
/// `padding` black pixels around every tile.
pub fn tile_grid(
    data: &[f32],
    count: usize,
    channels: usize,
    resolution: usize,
    columns: usize,
    padding: u32,
) -> Option<DynamicImage> {
    let plane = resolution * resolution;
    let expected_len = count * channels * plane;
    if data.len() != expected_len || count == 0 || columns == 0 {
        tracing::warn!(
            expected = expected_len,
            actual = data.len(),
            "mismatched sample data length"
        );
        return None;
    }

    let columns = columns.min(count);
    let rows = count.div_ceil(columns);
    let cell = resolution as u32 + padding;
    let width = columns as u32 * cell + padding;
    let height = rows as u32 * cell + padding;

    // Reversing the normalization: (val + 1.0) * 127.5
    let pixel = |image: usize, channel: usize, y: usize, x: usize| {
        let val = data[image * channels * plane + channel * plane + y * resolution + x];
        ((val + 1.0) * 127.5).clamp(0.0, 255.0) as u8
    };
    let origin = |image: usize| {
        (
            (image % columns) as u32 * cell + padding,
            (image / columns) as u32 * cell + padding,
        )
    };

    match channels {
        1 => {
            let mut grid = GrayImage::new(width, height);
            for image in 0..count {
                let (left, top) = origin(image);
                for y in 0..resolution {
                    for x in 0..resolution {
                        grid.put_pixel(
                            left + x as u32,
                            top + y as u32,
                            image::Luma([pixel(image, 0, y, x)]),
                        );
                    }
                }
            }
            Some(DynamicImage::ImageLuma8(grid))
        }
        3 => {
            let mut grid = RgbImage::new(width, height);
            for image in 0..count {
                let (left, top) = origin(image);
                for y in 0..resolution {
                    for x in 0..resolution {
                        let rgb = [0, 1, 2].map(|c| pixel(image, c, y, x));
                        grid.put_pixel(left + x as u32, top + y as u32, Rgb(rgb));
                    }
                }
            }
            Some(DynamicImage::ImageRgb8(grid))
        }
        _ => {
            tracing::warn!(channels, "sample grids support 1 or 3 channels");
            None
        }
    }
}
