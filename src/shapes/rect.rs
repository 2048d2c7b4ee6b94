use serde::{Deserialize, Serialize};

use super::point::Point;

/// Top-left anchored rectangle in image pixels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl From<Rect> for imageproc::rect::Rect {
    fn from(r: Rect) -> imageproc::rect::Rect {
        imageproc::rect::Rect::at(r.x, r.y).of_size(r.w.max(1) as u32, r.h.max(1) as u32)
    }
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect { x, y, w, h }
    }

    pub fn left(&self) -> i32 {
        self.x
    }
    pub fn right(&self) -> i32 {
        self.x + self.w
    }
    pub fn top(&self) -> i32 {
        self.y
    }
    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn center(&self) -> Point {
        Point {
            x: round_half_up(self.x as f32 + self.w as f32 / 2.),
            y: round_half_up(self.y as f32 + self.h as f32 / 2.),
        }
    }

    /// Squares up an `[x0, y0, x1, y1]` box around its center.
    ///
    /// Corner semantics follow canvas pixels: top left included, bottom
    /// right excluded.
    pub fn square_box(corners: &[f32; 4]) -> Rect {
        let [mut x0, mut y0, mut x1, mut y1] = *corners;

        let w = x1 - x0;
        let h = y1 - y0;

        if w != h {
            let half_diff = (w - h).abs() / 2.;
            if w > h {
                y0 -= half_diff;
                y1 += half_diff;
            } else {
                x0 -= half_diff;
                x1 += half_diff;
            }
        }

        Rect {
            x: round_half_up(x0),
            y: round_half_up(y0),
            w: round_half_up(x1 - x0),
            h: round_half_up(y1 - y0),
        }
    }
}

pub(crate) fn round_half_up(v: f32) -> i32 {
    (v + 0.5).floor() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_box_grows_short_side() {
        let r = Rect::square_box(&[10., 20., 30., 60.]);
        assert_eq!(r, Rect::new(0, 20, 40, 40));

        let r = Rect::square_box(&[0., 0., 40., 20.]);
        assert_eq!(r, Rect::new(0, -10, 40, 40));
    }

    #[test]
    fn square_box_rounds_fractions() {
        let r = Rect::square_box(&[1.4, 2.6, 11.4, 12.6]);
        assert_eq!(r, Rect::new(1, 3, 10, 10));
    }

    #[test]
    fn rounds_half_toward_positive() {
        assert_eq!(round_half_up(-0.5), 0);
        assert_eq!(round_half_up(0.5), 1);
        assert_eq!(round_half_up(-1.6), -2);
    }

    #[test]
    fn center_of_rect() {
        let r = Rect::new(10, 10, 5, 5);
        assert_eq!(r.center(), Point::new(13, 13));
        assert_eq!(r.right(), 15);
        assert_eq!(r.bottom(), 15);
    }
}
