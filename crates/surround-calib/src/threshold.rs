use image::{GrayImage, ImageBuffer, Luma};

/// Adaptive mean threshold.
///
/// A pixel becomes 255 when it is brighter than the mean of its
/// `block_size x block_size` neighbourhood minus `bias`, otherwise 0. The
/// neighbourhood replicates edge pixels, and the mean is rounded to an
/// integer before comparing, so perfectly flat regions come out black for
/// `bias = 0` and white for any positive bias.
pub fn adaptive_threshold_mean(src: &GrayImage, block_size: u32, bias: i32) -> GrayImage {
    let (w, h) = src.dimensions();
    if w == 0 || h == 0 {
        return GrayImage::new(w, h);
    }
    let radius = (block_size.max(3) / 2) as i64;
    let area = ((2 * radius + 1) * (2 * radius + 1)) as f64;
    let (wi, hi) = (w as i64, h as i64);
    let px = |x: i64, y: i64| {
        src.get_pixel(x.clamp(0, wi - 1) as u32, y.clamp(0, hi - 1) as u32)[0]
    };

    // horizontal running sums, then vertical running sums of those
    let mut row_sums = vec![0u32; (w * h) as usize];
    for y in 0..hi {
        let mut acc: u32 = (-radius..=radius).map(|dx| px(dx, y) as u32).sum();
        for x in 0..wi {
            row_sums[(y * wi + x) as usize] = acc;
            acc = acc + px(x + radius + 1, y) as u32 - px(x - radius, y) as u32;
        }
    }

    let row_sum = |x: i64, y: i64| row_sums[(y.clamp(0, hi - 1) * wi + x) as usize];
    let mut out: GrayImage = ImageBuffer::new(w, h);
    for x in 0..wi {
        let mut acc: u32 = (-radius..=radius).map(|dy| row_sum(x, dy)).sum();
        for y in 0..hi {
            let mean = (acc as f64 / area).round() as i32;
            let value = px(x, y) as i32;
            let on = value - mean > -bias;
            out.put_pixel(x as u32, y as u32, Luma([if on { 255 } else { 0 }]));
            acc = acc + row_sum(x, y + radius + 1) - row_sum(x, y - radius);
        }
    }
    out
}
