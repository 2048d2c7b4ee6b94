//! Box arithmetic of the MTCNN cascade.
//!
//! Coordinates are `f32` pixels; `pad` works on the 1-based inclusive
//! ranges the networks were trained with.

use ndarray::{ArrayView2, ArrayView3};

const STRIDE: f32 = 2.;
const CELL_SIZE: f32 = 12.;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Candidate {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub reg: [f32; 4],
}

impl Candidate {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
            reg: [0.; 4],
        }
    }

    pub fn to_array(&self) -> [f32; 5] {
        [self.x1, self.y1, self.x2, self.y2, self.score]
    }

    fn area(&self) -> f32 {
        (self.x2 - self.x1 + 1.) * (self.y2 - self.y1 + 1.)
    }

    /// Applies `reg` scaled by the box size, `extra` is added to width and height.
    pub fn regress(&mut self, reg: [f32; 4], extra: f32) {
        let w = self.x2 - self.x1 + extra;
        let h = self.y2 - self.y1 + extra;
        self.x1 += reg[0] * w;
        self.y1 += reg[1] * h;
        self.x2 += reg[2] * w;
        self.y2 += reg[3] * h;
    }

    /// Expands to a square with the longer side, keeping the center.
    pub fn rerec(&mut self) {
        let h = self.y2 - self.y1;
        let w = self.x2 - self.x1;
        let l = w.max(h);
        self.x1 += w * 0.5 - l * 0.5;
        self.y1 += h * 0.5 - l * 0.5;
        self.x2 = self.x1 + l;
        self.y2 = self.y1 + l;
    }

    pub fn fix(&mut self) {
        self.x1 = self.x1.trunc();
        self.y1 = self.y1.trunc();
        self.x2 = self.x2.trunc();
        self.y2 = self.y2.trunc();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmsMethod {
    Union,
    Min,
}

/// Scales of the image pyramid, largest first.
pub fn scale_pyramid(height: usize, width: usize, min_size: f32, factor: f32) -> Vec<f32> {
    let m = CELL_SIZE / min_size;
    let mut min_l = height.min(width) as f32 * m;
    let mut scales = Vec::new();
    let mut factor_count = 0;

    while min_l >= CELL_SIZE {
        scales.push(m * factor.powi(factor_count));
        min_l *= factor;
        factor_count += 1;
    }

    scales
}

/// Turns the P-Net heat map into candidates.
///
/// Both views are indexed `[x, y]` (the network runs on transposed images).
pub fn generate_bounding_boxes(
    prob: ArrayView2<f32>,
    reg: ArrayView3<f32>,
    scale: f32,
    threshold: f32,
) -> Vec<Candidate> {
    let mut boxes = Vec::new();

    for ((cx, cy), score) in prob.indexed_iter() {
        if *score < threshold {
            continue;
        }
        let (bx, by) = (cx as f32, cy as f32);
        boxes.push(Candidate {
            x1: ((STRIDE * bx + 1.) / scale).trunc(),
            y1: ((STRIDE * by + 1.) / scale).trunc(),
            x2: ((STRIDE * bx + CELL_SIZE) / scale).trunc(),
            y2: ((STRIDE * by + CELL_SIZE) / scale).trunc(),
            score: *score,
            reg: [
                reg[[cx, cy, 0]],
                reg[[cx, cy, 1]],
                reg[[cx, cy, 2]],
                reg[[cx, cy, 3]],
            ],
        });
    }

    boxes
}

/// Greedy suppression, returns kept indices from the highest score down.
pub fn nms(boxes: &[Candidate], threshold: f32, method: NmsMethod) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|a, b| boxes[*a].score.total_cmp(&boxes[*b].score));

    let mut pick = Vec::new();
    while let Some(i) = order.pop() {
        pick.push(i);
        let best = &boxes[i];

        order.retain(|&j| {
            let other = &boxes[j];
            let w = (best.x2.min(other.x2) - best.x1.max(other.x1) + 1.).max(0.);
            let h = (best.y2.min(other.y2) - best.y1.max(other.y1) + 1.).max(0.);
            let inter = w * h;
            let o = match method {
                NmsMethod::Min => inter / best.area().min(other.area()),
                NmsMethod::Union => inter / (best.area() + other.area() - inter),
            };
            o <= threshold
        });
    }

    pick
}

pub fn select(boxes: &[Candidate], pick: &[usize]) -> Vec<Candidate> {
    pick.iter().map(|&i| boxes[i]).collect()
}

/// Crop ranges of a box clipped to a `w x h` image, 1-based and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    pub dy: i32,
    pub edy: i32,
    pub dx: i32,
    pub edx: i32,
    pub y: i32,
    pub ey: i32,
    pub x: i32,
    pub ex: i32,
    pub tmpw: i32,
    pub tmph: i32,
}

pub fn pad(b: &Candidate, w: usize, h: usize) -> Padding {
    let (w, h) = (w as i32, h as i32);
    let tmpw = (b.x2 - b.x1 + 1.) as i32;
    let tmph = (b.y2 - b.y1 + 1.) as i32;

    let mut p = Padding {
        dy: 1,
        edy: tmph,
        dx: 1,
        edx: tmpw,
        y: b.y1 as i32,
        ey: b.y2 as i32,
        x: b.x1 as i32,
        ex: b.x2 as i32,
        tmpw,
        tmph,
    };

    if p.ex > w {
        p.edx = -p.ex + w + tmpw;
        p.ex = w;
    }
    if p.ey > h {
        p.edy = -p.ey + h + tmph;
        p.ey = h;
    }
    if p.x < 1 {
        p.dx = 2 - p.x;
        p.x = 1;
    }
    if p.y < 1 {
        p.dy = 2 - p.y;
        p.y = 1;
    }

    p
}
