// src/geometry.rs
//
// Bounding-box primitives shared by the association engine and the
// person tracker. Boxes are [x1, y1, x2, y2] in pixels.

use crate::types::BBox;

pub fn area(b: &BBox) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

pub fn center(b: &BBox) -> (f32, f32) {
    ((b[0] + b[2]) * 0.5, (b[1] + b[3]) * 0.5)
}

/// Intersection over union in [0, 1]. Degenerate boxes (zero union) give 0.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter <= 0.0 {
        return 0.0;
    }

    let union = area(a) + area(b) - inter;
    if union > 0.0 {
        (inter / union).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// True when the center of `inner` lies strictly inside `outer`.
pub fn contains_center(outer: &BBox, inner: &BBox) -> bool {
    let (cx, cy) = center(inner);
    outer[0] < cx && cx < outer[2] && outer[1] < cy && cy < outer[3]
}

/// Clamp a box to the frame and round outward to whole pixels.
/// Returns (x, y, width, height), or None when nothing is left.
pub fn clamp_to_frame(b: &BBox, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
    let x1 = b[0].floor().max(0.0).min(frame_w as f32) as u32;
    let y1 = b[1].floor().max(0.0).min(frame_h as f32) as u32;
    let x2 = b[2].ceil().max(0.0).min(frame_w as f32) as u32;
    let y2 = b[3].ceil().max(0.0).min(frame_h as f32) as u32;

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2 - x1, y2 - y1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_overlap() {
        let a = [0.0, 0.0, 100.0, 100.0];
        let b = [50.0, 50.0, 150.0, 150.0];
        let score = iou(&a, &b);
        assert!((score - 2500.0 / 17500.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_symmetric() {
        let a = [100.0, 100.0, 300.0, 500.0];
        let b = [120.0, 90.0, 220.0, 160.0];
        assert_eq!(iou(&a, &b), iou(&b, &a));
    }

    #[test]
    fn test_iou_identity_is_one() {
        let a = [10.0, 20.0, 60.0, 90.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = [0.0, 0.0, 50.0, 50.0];
        let b = [100.0, 100.0, 200.0, 200.0];
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_touching_edges_is_zero() {
        let a = [0.0, 0.0, 50.0, 50.0];
        let b = [50.0, 0.0, 100.0, 50.0];
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let point = [10.0, 10.0, 10.0, 10.0];
        assert_eq!(iou(&point, &point), 0.0);
        let inverted = [50.0, 50.0, 0.0, 0.0];
        assert_eq!(iou(&inverted, &[0.0, 0.0, 50.0, 50.0]), 0.0);
    }

    #[test]
    fn test_helmet_scenario_iou() {
        let person = [100.0, 100.0, 300.0, 500.0];
        let helmet = [120.0, 90.0, 220.0, 160.0];
        // inter = 100 * 60, union = 80000 + 7000 - 6000
        let expected = 6000.0 / 81000.0;
        assert!((iou(&person, &helmet) - expected).abs() < 1e-6);
        assert!(contains_center(&person, &helmet));
    }

    #[test]
    fn test_contains_center_is_strict() {
        let outer = [0.0, 0.0, 100.0, 100.0];
        // center exactly on the right edge
        let on_edge = [90.0, 40.0, 110.0, 60.0];
        assert!(!contains_center(&outer, &on_edge));
        let inside = [40.0, 40.0, 60.0, 60.0];
        assert!(contains_center(&outer, &inside));
    }

    #[test]
    fn test_clamp_to_frame() {
        assert_eq!(
            clamp_to_frame(&[-10.0, 5.5, 50.2, 700.0], 640, 480),
            Some((0, 5, 51, 475))
        );
        assert_eq!(clamp_to_frame(&[700.0, 0.0, 800.0, 10.0], 640, 480), None);
    }
}
