use anyhow::bail;
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Brushes with hardness at or above this stamp a crisp square instead of a disc.
const SQUARE_HARDNESS: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// What a stroke does to the erase mask.
pub enum StrokeMode {
    /// Paint toward full erase weight (reveals the filtered image).
    Erase,
    /// Paint back toward zero weight (restores the original image).
    Restore,
    /// Reset the whole raster to zero. Points and radius are ignored.
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One committed freehand stroke, in normalized image coordinates.
///
/// Strokes are the unit of mask history: undo/redo replays stroke lists
/// instead of storing pixel diffs.
pub struct Stroke {
    pub points: Vec<(f32, f32)>,
    pub radius_px: f32,
    pub hardness: f32,
    pub mode: StrokeMode,
}

#[derive(Debug, Clone, PartialEq)]
/// Single-channel erase-weight raster: 0 = fully original, 255 = fully filtered.
///
/// Carries a monotonically increasing revision so consumers can detect
/// changes by comparing versions rather than buffer identity.
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<u8>,
    revision: u64,
}

impl Mask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width as usize) * (height as usize)],
            revision: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[(y as usize) * (self.width as usize) + (x as usize)]
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
        self.revision += 1;
    }

    /// Copies the raster into a `Luma<u8>` image, e.g. for texture upload
    /// or debug dumps.
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Stamps one stroke into the raster. Erase accumulates with `max`,
    /// restore carves with `min`, so later strokes of the opposite mode
    /// subtract rather than add.
    pub fn apply_stroke(&mut self, stroke: &Stroke) {
        match stroke.mode {
            StrokeMode::Clear => {
                self.data.fill(0);
                self.revision += 1;
                return;
            }
            StrokeMode::Erase | StrokeMode::Restore => {}
        }
        let Some((&first, rest)) = stroke.points.split_first() else {
            return;
        };
        self.stamp_disc(first, stroke.radius_px, stroke.hardness, stroke.mode);
        let mut prev = first;
        for &p in rest {
            self.stamp_capsule(prev, p, stroke.radius_px, stroke.hardness, stroke.mode);
            prev = p;
        }
    }

    /// Stamps a filled disc (square above the hardness threshold) centered
    /// at a normalized point.
    pub fn stamp_disc(&mut self, point: (f32, f32), radius: f32, hardness: f32, mode: StrokeMode) {
        let c = self.to_pixel(point);
        self.stamp(c, c, radius, hardness, mode);
    }

    /// Stamps a capsule (line segment with round caps) between two
    /// normalized points.
    pub fn stamp_capsule(
        &mut self,
        from: (f32, f32),
        to: (f32, f32),
        radius: f32,
        hardness: f32,
        mode: StrokeMode,
    ) {
        let a = self.to_pixel(from);
        let b = self.to_pixel(to);
        self.stamp(a, b, radius, hardness, mode);
    }

    fn to_pixel(&self, point: (f32, f32)) -> (f32, f32) {
        (point.0 * self.width as f32, point.1 * self.height as f32)
    }

    fn stamp(&mut self, a: (f32, f32), b: (f32, f32), radius: f32, hardness: f32, mode: StrokeMode) {
        if radius <= 0.0 || self.width == 0 || self.height == 0 {
            return;
        }
        let hardness = hardness.clamp(0.0, 1.0);

        let min_x = (a.0.min(b.0) - radius).floor().max(0.0) as u32;
        let max_x = (a.0.max(b.0) + radius).ceil().min(self.width as f32 - 1.0) as u32;
        let min_y = (a.1.min(b.1) - radius).floor().max(0.0) as u32;
        let max_y = (a.1.max(b.1) + radius).ceil().min(self.height as f32 - 1.0) as u32;
        if min_x > max_x || min_y > max_y {
            return;
        }

        let square = hardness >= SQUARE_HARDNESS;
        for y in min_y..=max_y {
            let row = (y as usize) * (self.width as usize);
            for x in min_x..=max_x {
                let px = x as f32 + 0.5;
                let py = y as f32 + 0.5;
                let dist = if square {
                    segment_distance_chebyshev(px, py, a, b)
                } else {
                    segment_distance(px, py, a, b)
                };
                let cov = coverage(dist, radius, hardness);
                if cov <= 0.0 {
                    continue;
                }
                let w = (cov * 255.0).round() as u8;
                let cell = &mut self.data[row + x as usize];
                *cell = match mode {
                    StrokeMode::Erase => (*cell).max(w),
                    StrokeMode::Restore => (*cell).min(255 - w),
                    StrokeMode::Clear => 0,
                };
            }
        }
        self.revision += 1;
    }
}

/// Brush coverage at `dist` from the stroke spine: 1 inside the hard core,
/// linear falloff out to the radius.
fn coverage(dist: f32, radius: f32, hardness: f32) -> f32 {
    let inner = radius * hardness;
    if dist <= inner {
        1.0
    } else if dist >= radius {
        0.0
    } else {
        1.0 - (dist - inner) / (radius - inner)
    }
}

fn segment_distance(px: f32, py: f32, a: (f32, f32), b: (f32, f32)) -> f32 {
    let (cx, cy) = closest_on_segment(px, py, a, b);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

fn segment_distance_chebyshev(px: f32, py: f32, a: (f32, f32), b: (f32, f32)) -> f32 {
    let (cx, cy) = closest_on_segment(px, py, a, b);
    (px - cx).abs().max((py - cy).abs())
}

fn closest_on_segment(px: f32, py: f32, a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    let dx = b.0 - a.0;
    let dy = b.1 - a.1;
    let len_sq = dx * dx + dy * dy;
    if len_sq <= 1e-12 {
        return a;
    }
    let t = (((px - a.0) * dx + (py - a.1) * dy) / len_sq).clamp(0.0, 1.0);
    (a.0 + t * dx, a.1 + t * dy)
}

/// Incremental stroke painter over a [`Mask`], with a low-resolution live
/// preview raster mirroring only the in-progress stroke.
///
/// The committed stroke list is the deterministic source of truth:
/// `rebuild_from` replays it from a blank raster, which is how undo/redo
/// and mid-stroke cancellation restore mask state.
pub struct MaskPainter {
    mask: Mask,
    preview: Mask,
    preview_downscale: u32,
    hardness: f32,
    committed: Vec<Stroke>,
    active: Option<Stroke>,
}

impl MaskPainter {
    pub fn new(width: u32, height: u32, preview_downscale: u32, hardness: f32) -> Self {
        let scale = preview_downscale.max(1);
        Self {
            mask: Mask::new(width, height),
            preview: Mask::new((width / scale).max(1), (height / scale).max(1)),
            preview_downscale: scale,
            hardness: hardness.clamp(0.0, 1.0),
            committed: Vec::new(),
            active: None,
        }
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn live_preview(&self) -> &Mask {
        &self.preview
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.committed
    }

    pub fn stroke_in_progress(&self) -> bool {
        self.active.is_some()
    }

    /// Starts a stroke and stamps its first point.
    pub fn begin(&mut self, point: (f32, f32), radius_px: f32, mode: StrokeMode) -> anyhow::Result<()> {
        if self.active.is_some() {
            bail!("stroke already in progress");
        }
        if radius_px <= 0.0 {
            bail!("stroke radius must be positive");
        }
        let stroke = Stroke {
            points: vec![point],
            radius_px,
            hardness: self.hardness,
            mode,
        };
        self.mask.stamp_disc(point, radius_px, self.hardness, mode);
        self.preview
            .stamp_disc(point, self.preview_radius(radius_px), self.hardness, mode);
        self.active = Some(stroke);
        Ok(())
    }

    /// Extends the in-progress stroke with a capsule to the new point.
    pub fn extend(&mut self, point: (f32, f32)) -> anyhow::Result<()> {
        let Some(active) = self.active.as_mut() else {
            bail!("extend called with no stroke in progress");
        };
        let prev = *active.points.last().unwrap_or(&point);
        let radius = active.radius_px;
        let hardness = active.hardness;
        let mode = active.mode;
        active.points.push(point);
        self.mask.stamp_capsule(prev, point, radius, hardness, mode);
        let pr = self.preview_radius(radius);
        self.preview.stamp_capsule(prev, point, pr, hardness, mode);
        Ok(())
    }

    /// Commits the in-progress stroke and clears the live preview.
    pub fn end(&mut self) -> anyhow::Result<()> {
        let Some(stroke) = self.active.take() else {
            bail!("end called with no stroke in progress");
        };
        self.committed.push(stroke);
        self.preview.fill(0);
        Ok(())
    }

    /// Discards the in-progress stroke without committing it (the
    /// multi-touch abort path). The raster is rebuilt from the committed
    /// strokes so the partial paint disappears.
    pub fn cancel(&mut self) {
        if self.active.take().is_none() {
            return;
        }
        self.preview.fill(0);
        let strokes = std::mem::take(&mut self.committed);
        self.rebuild_from(&strokes);
    }

    /// Resets the raster and forgets all committed strokes.
    pub fn clear(&mut self) {
        self.active = None;
        self.committed.clear();
        self.mask.fill(0);
        self.preview.fill(0);
    }

    /// Replays an ordered stroke list onto a blank raster.
    pub fn rebuild_from(&mut self, strokes: &[Stroke]) {
        self.active = None;
        self.preview.fill(0);
        self.mask.fill(0);
        for stroke in strokes {
            self.mask.apply_stroke(stroke);
        }
        self.committed = strokes.to_vec();
    }

    fn preview_radius(&self, radius_px: f32) -> f32 {
        (radius_px / self.preview_downscale as f32).max(1.0)
    }
}
