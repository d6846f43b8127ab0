//! Grid motion detector on grayscale frames.
//!
//! Each frame is box-blurred and compared against both the previous frame
//! and a running-average background. A pixel counts as changed when the
//! larger of the two differences clears the noise floor and the sensitivity
//! threshold. The frame is split into a grid; a cell "moves" when its score
//! (summed change over `cell_pixels * 255`) exceeds 0.01. Motion is reported
//! when the share of moving cells reaches `min_area`.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

pub const DEFAULT_GRID_SIZE: usize = 8;
pub const DEFAULT_SENSITIVITY: f32 = 0.15;
pub const DEFAULT_MIN_MOTION_AREA: f32 = 0.005;
pub const DEFAULT_BLUR_RADIUS: usize = 1;
pub const DEFAULT_NOISE_THRESHOLD: u8 = 10;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);
pub const BACKGROUND_LEARNING_RATE: f32 = 0.05;
pub const MOTION_LEARNING_RATE: f32 = 0.01;

const CELL_MOTION_SCORE: f32 = 0.01;

#[derive(Clone, Debug, PartialEq)]
pub struct MotionConfig {
    pub grid_size: usize,
    pub sensitivity: f32,
    pub min_area: f32,
    pub blur_radius: usize,
    pub noise_threshold: u8,
    pub cooldown: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            sensitivity: DEFAULT_SENSITIVITY,
            min_area: DEFAULT_MIN_MOTION_AREA,
            blur_radius: DEFAULT_BLUR_RADIUS,
            noise_threshold: DEFAULT_NOISE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl MotionConfig {
    /// Out-of-range values fall back to their defaults.
    pub fn sanitized(mut self) -> Self {
        if !(self.sensitivity > 0.0 && self.sensitivity <= 1.0) {
            self.sensitivity = DEFAULT_SENSITIVITY;
        }
        if !(self.min_area > 0.0 && self.min_area <= 1.0) {
            self.min_area = DEFAULT_MIN_MOTION_AREA;
        }
        if self.blur_radius > 5 {
            self.blur_radius = DEFAULT_BLUR_RADIUS;
        }
        if self.noise_threshold > 50 {
            self.noise_threshold = DEFAULT_NOISE_THRESHOLD;
        }
        if !(2..=32).contains(&self.grid_size) {
            self.grid_size = DEFAULT_GRID_SIZE;
        }
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotionOutcome {
    pub detected: bool,
    /// Highest cell score.
    pub score: f32,
    /// Share of cells with motion.
    pub area: f32,
}

pub struct MotionDetector {
    config: MotionConfig,
    width: usize,
    height: usize,
    prev: Vec<u8>,
    background: Vec<u8>,
    blurred: Vec<u8>,
    grid_scores: Vec<f32>,
    last_detection: Option<Instant>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        let config = config.sanitized();
        let cells = config.grid_size * config.grid_size;
        Self {
            config,
            width: 0,
            height: 0,
            prev: Vec::new(),
            background: Vec::new(),
            blurred: Vec::new(),
            grid_scores: vec![0.0; cells],
            last_detection: None,
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn grid_scores(&self) -> &[f32] {
        &self.grid_scores
    }

    /// Forget the background; the next frame seeds it again.
    pub fn reset(&mut self) {
        self.width = 0;
        self.height = 0;
        self.prev.clear();
        self.background.clear();
        self.blurred.clear();
        self.last_detection = None;
    }

    /// Feed one grayscale frame observed at `now`.
    pub fn process(&mut self, gray: &[u8], width: u32, height: u32, now: Instant) -> Result<MotionOutcome> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || gray.len() < w * h {
            return Err(anyhow!(
                "motion frame {}x{} needs {} bytes, got {}",
                width,
                height,
                w * h,
                gray.len()
            ));
        }
        let gray = &gray[..w * h];

        if let Some(last) = self.last_detection {
            if now.saturating_duration_since(last) < self.config.cooldown {
                return Ok(MotionOutcome::default());
            }
        }

        if self.width != w || self.height != h || self.prev.is_empty() {
            self.width = w;
            self.height = h;
            self.blurred = vec![0; w * h];
            box_blur(gray, &mut self.blurred, w, h, self.config.blur_radius);
            self.prev = self.blurred.clone();
            self.background = self.blurred.clone();
            return Ok(MotionOutcome::default());
        }

        box_blur(gray, &mut self.blurred, w, h, self.config.blur_radius);
        let (score, area) = self.grid_motion();
        let detected = area >= self.config.min_area && score > CELL_MOTION_SCORE;

        let rate = if detected {
            MOTION_LEARNING_RATE
        } else {
            BACKGROUND_LEARNING_RATE
        };
        for (bg, cur) in self.background.iter_mut().zip(&self.blurred) {
            *bg = ((1.0 - rate) * *bg as f32 + rate * *cur as f32) as u8;
        }
        self.prev.copy_from_slice(&self.blurred);

        if detected {
            self.last_detection = Some(now);
        }
        Ok(MotionOutcome {
            detected,
            score,
            area,
        })
    }

    fn grid_motion(&mut self) -> (f32, f32) {
        let (w, h) = (self.width, self.height);
        let grid = self.config.grid_size;
        let cell_w = (w / grid).max(1);
        let cell_h = (h / grid).max(1);
        let sensitivity = self.config.sensitivity * 255.0;
        let noise = self.config.noise_threshold as i32;

        let mut moving = 0usize;
        let mut max_score = 0.0f32;
        for gy in 0..grid {
            for gx in 0..grid {
                let x0 = (gx * cell_w).min(w);
                let y0 = (gy * cell_h).min(h);
                let x1 = ((gx + 1) * cell_w).min(w);
                let y1 = ((gy + 1) * cell_h).min(h);
                let mut pixels = 0u64;
                let mut total_diff = 0u64;
                for y in y0..y1 {
                    let row = y * w;
                    for x in x0..x1 {
                        let i = row + x;
                        let cur = self.blurred[i] as i32;
                        let diff = (cur - self.prev[i] as i32)
                            .abs()
                            .max((cur - self.background[i] as i32).abs());
                        if diff > noise && diff as f32 > sensitivity {
                            total_diff += diff as u64;
                        }
                        pixels += 1;
                    }
                }
                let score = if pixels == 0 {
                    0.0
                } else {
                    total_diff as f32 / (pixels * 255) as f32
                };
                self.grid_scores[gy * grid + gx] = score;
                if score > CELL_MOTION_SCORE {
                    moving += 1;
                    max_score = max_score.max(score);
                }
            }
        }
        (max_score, moving as f32 / (grid * grid) as f32)
    }
}

fn box_blur(src: &[u8], dst: &mut [u8], w: usize, h: usize, radius: usize) {
    if radius == 0 {
        dst.copy_from_slice(src);
        return;
    }
    for y in 0..h {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius).min(h - 1);
        for x in 0..w {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius).min(w - 1);
            let mut sum = 0u32;
            let mut count = 0u32;
            for yy in y0..=y1 {
                let row = &src[yy * w + x0..=yy * w + x1];
                sum += row.iter().map(|&p| p as u32).sum::<u32>();
                count += row.len() as u32;
            }
            dst[y * w + x] = (sum / count) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 64;
    const H: u32 = 48;

    fn flat(value: u8) -> Vec<u8> {
        vec![value; (W * H) as usize]
    }

    fn with_block(base: u8, block: u8) -> Vec<u8> {
        let mut frame = flat(base);
        for y in 8..24 {
            for x in 8..24 {
                frame[y * W as usize + x] = block;
            }
        }
        frame
    }

    #[test]
    fn first_frame_only_seeds() {
        let mut detector = MotionDetector::new(MotionConfig::default());
        let outcome = detector.process(&with_block(40, 230), W, H, Instant::now()).unwrap();
        assert!(!outcome.detected);
    }

    #[test]
    fn detects_block_and_respects_cooldown() {
        let mut detector = MotionDetector::new(MotionConfig::default());
        let t0 = Instant::now();
        detector.process(&flat(40), W, H, t0).unwrap();
        let still = detector.process(&flat(40), W, H, t0 + Duration::from_millis(100)).unwrap();
        assert!(!still.detected);

        let hit = detector
            .process(&with_block(40, 230), W, H, t0 + Duration::from_millis(200))
            .unwrap();
        assert!(hit.detected);
        assert!(hit.score > 0.01);
        assert!(hit.area >= DEFAULT_MIN_MOTION_AREA);

        let cooling = detector
            .process(&flat(40), W, H, t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(cooling, MotionOutcome::default());
    }

    #[test]
    fn noise_below_threshold_is_ignored() {
        let mut detector = MotionDetector::new(MotionConfig::default());
        let t0 = Instant::now();
        detector.process(&flat(100), W, H, t0).unwrap();
        let outcome = detector
            .process(&flat(108), W, H, t0 + Duration::from_millis(100))
            .unwrap();
        assert!(!outcome.detected);
        assert_eq!(outcome.area, 0.0);
    }

    #[test]
    fn short_frame_is_rejected() {
        let mut detector = MotionDetector::new(MotionConfig::default());
        assert!(detector.process(&[0u8; 10], W, H, Instant::now()).is_err());
    }

    #[test]
    fn sanitize_restores_defaults() {
        let cfg = MotionConfig {
            grid_size: 64,
            sensitivity: 3.0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(cfg.grid_size, DEFAULT_GRID_SIZE);
        assert_eq!(cfg.sensitivity, DEFAULT_SENSITIVITY);
    }
}
