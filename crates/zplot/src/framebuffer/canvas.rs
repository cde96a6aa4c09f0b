use super::device::DeviceGeometry;
use photon_wire::PhotonEvent;

/// Detector space to device pixels.
///
/// Both axes use the same ratio, `(width - 1) / (2^bits - 1)`, so the full
/// detector range spans the screen width and square detectors stay square.
/// Rounding is `f64::round`: halves go away from zero.
#[derive(Debug, Clone, Copy)]
pub struct CoordinateMapper {
    scale: f64,
    width: usize,
    height: usize,
}

impl CoordinateMapper {
    /// `source_bits` is clamped to 1..=16.
    pub fn new(geometry: &DeviceGeometry, source_bits: u8) -> Self {
        let bits = source_bits.clamp(1, 16) as u32;
        let source_max = ((1u32 << bits) - 1) as f64;
        Self {
            scale: geometry.width.saturating_sub(1) as f64 / source_max,
            width: geometry.width,
            height: geometry.height,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Screen pixel for a detector coordinate, or `None` if it lands off screen.
    #[inline]
    pub fn map(&self, x: u16, y: u16) -> Option<(usize, usize)> {
        let sx = (x as f64 * self.scale).round() as usize;
        let sy = (y as f64 * self.scale).round() as usize;
        (sx < self.width && sy < self.height).then_some((sx, sy))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plot {
    Plotted { x: usize, y: usize },
    OutOfBounds,
}

/// Accumulated image plus the counters and gain that go with it.
///
/// Shared between the ingest and render duties behind one mutex; every
/// method is short enough to run under that lock.
pub struct Canvas {
    geometry: DeviceGeometry,
    mapper: CoordinateMapper,
    accum: Vec<f32>,
    gain: f32,
    photons_total: u64,
    photons_current: u64,
}

impl Canvas {
    pub fn new(geometry: DeviceGeometry, source_bits: u8, gain: f32) -> Self {
        Self {
            geometry,
            mapper: CoordinateMapper::new(&geometry, source_bits),
            accum: vec![0.0; geometry.frame_len()],
            gain: sanitize_gain(gain),
            photons_total: 0,
            photons_current: 0,
        }
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    pub fn mapper(&self) -> &CoordinateMapper {
        &self.mapper
    }

    /// Adds one photon. Counters advance for every event consumed, including
    /// those that fall off screen.
    pub fn accumulate(&mut self, event: PhotonEvent) -> Plot {
        self.photons_total += 1;
        self.photons_current += 1;

        let Some((x, y)) = self.mapper.map(event.x, event.y) else {
            return Plot::OutOfBounds;
        };

        let base = self.geometry.offset(x, y);
        let intensity = event.intensity as f32;
        for c in self.geometry.layout.color_offsets() {
            self.accum[base + c] += intensity;
        }
        Plot::Plotted { x, y }
    }

    /// Zeroes the image and the current count. The total count survives.
    pub fn clear(&mut self) {
        self.accum.fill(0.0);
        self.photons_current = 0;
    }

    /// Writes `clip(round(value * gain), 0, 255)` for every channel.
    ///
    /// `frame` must be `geometry.frame_len()` bytes.
    pub fn render_into(&self, frame: &mut [u8]) {
        debug_assert_eq!(frame.len(), self.accum.len());
        let gain = self.gain;
        for (out, &value) in frame.iter_mut().zip(&self.accum) {
            *out = (value * gain).round().clamp(0.0, 255.0) as u8;
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Takes effect at the next render; accumulated values are untouched.
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = sanitize_gain(gain);
    }

    pub fn photons_total(&self) -> u64 {
        self.photons_total
    }

    pub fn photons_current(&self) -> u64 {
        self.photons_current
    }

    /// Raw accumulated value of one channel byte.
    pub fn value_at(&self, x: usize, y: usize, channel: usize) -> f32 {
        self.accum[self.geometry.offset(x, y) + channel]
    }
}

fn sanitize_gain(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::device::PixelLayout;

    fn geometry(layout: PixelLayout) -> DeviceGeometry {
        DeviceGeometry::new(480, 480, layout)
    }

    #[test]
    fn mapping_rounds_half_away_from_zero() {
        // scale = 14 / 7
        let g = DeviceGeometry::new(15, 15, PixelLayout::Rgb24);
        let m = CoordinateMapper::new(&g, 3);
        assert_eq!(m.scale(), 2.0);
        assert_eq!(m.map(7, 3), Some((14, 6)));

        // odd inputs land exactly on .5
        let g = DeviceGeometry::new(4, 4, PixelLayout::Rgb24);
        let m = CoordinateMapper {
            scale: 0.5,
            ..CoordinateMapper::new(&g, 2)
        };
        assert_eq!(m.map(1, 3), Some((1, 2)));
        assert_eq!(m.map(5, 0), Some((3, 0)));
    }

    #[test]
    fn full_detector_range_spans_screen_width() {
        let m = CoordinateMapper::new(&geometry(PixelLayout::Bgrx32), 14);
        assert_eq!(m.map(0, 0), Some((0, 0)));
        assert_eq!(m.map(16383, 16383), Some((479, 479)));
        assert_eq!(m.map(100, 200), Some((3, 6)));
        assert_eq!(m.map(4000, 8000), Some((117, 234)));
    }

    #[test]
    fn coordinates_beyond_source_range_are_dropped() {
        let mut canvas = Canvas::new(geometry(PixelLayout::Bgrx32), 14, 1.0);
        assert_eq!(canvas.accumulate(PhotonEvent::new(u16::MAX, 0, 9)), Plot::OutOfBounds);
        assert_eq!(canvas.photons_total(), 1);

        let mut frame = vec![0u8; canvas.geometry().frame_len()];
        canvas.render_into(&mut frame);
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn short_screens_drop_rows_past_height() {
        let g = DeviceGeometry::new(480, 100, PixelLayout::Rgb24);
        let mut canvas = Canvas::new(g, 14, 1.0);
        assert_eq!(canvas.accumulate(PhotonEvent::new(0, 16383, 1)), Plot::OutOfBounds);
        assert_eq!(
            canvas.accumulate(PhotonEvent::new(0, 3000, 1)),
            Plot::Plotted { x: 0, y: 88 }
        );
    }

    #[test]
    fn intensity_is_replicated_and_padding_left_zero() {
        let mut canvas = Canvas::new(geometry(PixelLayout::Bgrx32), 14, 1.0);
        canvas.accumulate(PhotonEvent::new(0, 0, 10));
        canvas.accumulate(PhotonEvent::new(0, 0, 5));

        assert_eq!(
            [0, 1, 2, 3].map(|c| canvas.value_at(0, 0, c)),
            [15.0, 15.0, 15.0, 0.0]
        );

        let mut frame = vec![0u8; canvas.geometry().frame_len()];
        canvas.render_into(&mut frame);
        assert_eq!(&frame[..4], &[15, 15, 15, 0]);
    }

    #[test]
    fn render_is_idempotent_and_clipped() {
        let mut canvas = Canvas::new(geometry(PixelLayout::Rgb24), 14, 1.0);
        canvas.accumulate(PhotonEvent::new(0, 0, 10));
        let mut a = vec![0u8; canvas.geometry().frame_len()];
        let mut b = vec![0u8; canvas.geometry().frame_len()];
        canvas.render_into(&mut a);
        canvas.render_into(&mut b);
        assert_eq!(&a[..3], &[10, 10, 10]);
        assert_eq!(a, b);

        canvas.set_gain(30.0);
        canvas.render_into(&mut a);
        assert_eq!(&a[..3], &[255, 255, 255]);
    }

    #[test]
    fn gain_does_not_touch_accumulation() {
        let mut canvas = Canvas::new(geometry(PixelLayout::Rgb24), 14, 1.0);
        canvas.accumulate(PhotonEvent::new(0, 0, 3));
        canvas.set_gain(2.5);

        assert_eq!(canvas.value_at(0, 0, 0), 3.0);
        let mut frame = vec![0u8; canvas.geometry().frame_len()];
        canvas.render_into(&mut frame);
        // 7.5 rounds away from zero
        assert_eq!(frame[0], 8);

        canvas.set_gain(f32::NAN);
        assert_eq!(canvas.gain(), 0.0);
        canvas.set_gain(-1.0);
        assert_eq!(canvas.gain(), 0.0);
    }

    #[test]
    fn clear_keeps_total_count() {
        let mut canvas = Canvas::new(geometry(PixelLayout::Bgrx32), 14, 1.0);
        for i in 0..5 {
            canvas.accumulate(PhotonEvent::new(i * 100, i * 100, 50));
        }
        canvas.clear();

        assert_eq!(canvas.photons_current(), 0);
        assert_eq!(canvas.photons_total(), 5);
        let mut frame = vec![1u8; canvas.geometry().frame_len()];
        canvas.render_into(&mut frame);
        assert!(frame.iter().all(|&b| b == 0));
    }
}
