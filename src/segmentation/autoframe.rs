use super::types::{AutoFrameTransform, Matte};
use crate::config::AutoFrameConfig;

/// Derive a pan/zoom transform from the foreground bounding box
///
/// Returns `None` when the matte has too little foreground to frame on.
pub fn compute_transform(matte: &Matte, config: &AutoFrameConfig) -> Option<AutoFrameTransform> {
    if matte.width == 0 || matte.height == 0 {
        return None;
    }
    if matte.coverage(config.threshold) < config.min_coverage {
        return None;
    }

    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (idx, &alpha) in matte.alpha.iter().enumerate() {
        if alpha < config.threshold {
            continue;
        }
        let x = idx as u32 % matte.width;
        let y = idx as u32 / matte.width;
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((min_x, min_y, max_x, max_y)) => {
                (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
            }
        });
    }
    let (min_x, min_y, max_x, max_y) = bounds?;

    let width = matte.width as f32;
    let height = matte.height as f32;

    let center_x = (min_x + max_x + 1) as f32 / 2.0;
    let center_y = (min_y + max_y + 1) as f32 / 2.0;
    let fill = (max_y - min_y + 1) as f32 / height;

    let zoom = (config.target_fill / fill).clamp(1.0, config.max_zoom.max(1.0));

    Some(AutoFrameTransform {
        offset_x: center_x / width - 0.5,
        offset_y: center_y / height - 0.5,
        zoom,
    })
}
