use std::sync::{Arc, PoisonError, RwLock};

/// Upper bound shared by every colour channel and the brightness scalar.
pub const CHANNEL_MAX: u16 = 4095;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightState {
    pub is_on: bool,
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub w: u16,
    pub brightness: u16,
}

impl LightState {
    /// Clamps every numeric field into `0..=CHANNEL_MAX`.
    pub fn sanitize(&mut self) {
        self.r = self.r.min(CHANNEL_MAX);
        self.g = self.g.min(CHANNEL_MAX);
        self.b = self.b.min(CHANNEL_MAX);
        self.w = self.w.min(CHANNEL_MAX);
        self.brightness = self.brightness.min(CHANNEL_MAX);
    }

    /// Effective `[r, g, b, w]` duty after applying on/off and brightness.
    pub fn output_levels(&self) -> [u16; 4] {
        if !self.is_on {
            return [0; 4];
        }

        let brightness = u32::from(self.brightness.min(CHANNEL_MAX));
        let scale = |channel: u16| -> u16 {
            let scaled = u32::from(channel.min(CHANNEL_MAX)) * brightness / u32::from(CHANNEL_MAX);
            // Bounded by CHANNEL_MAX, fits in u16.
            scaled as u16
        };

        [scale(self.r), scale(self.g), scale(self.b), scale(self.w)]
    }
}

/// Read-only view of the live light state.
///
/// Renderers poll [`LightReader::snapshot`] on their own cadence. Every
/// snapshot is a copy taken under one lock acquisition, so a colour change
/// and its on/off flag are always observed together.
#[derive(Debug, Clone)]
pub struct LightReader {
    inner: Arc<RwLock<LightState>>,
}

impl LightReader {
    pub(crate) fn new(inner: Arc<RwLock<LightState>>) -> Self {
        Self { inner }
    }

    pub fn snapshot(&self) -> LightState {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_dark() {
        let state = LightState::default();
        assert!(!state.is_on);
        assert_eq!(state.output_levels(), [0, 0, 0, 0]);
    }

    #[test]
    fn output_scales_with_brightness() {
        let state = LightState {
            is_on: true,
            r: 4095,
            g: 2048,
            b: 0,
            w: 4095,
            brightness: 2048,
        };

        assert_eq!(state.output_levels(), [2048, 1024, 0, 2048]);
    }

    #[test]
    fn output_is_zero_when_off() {
        let state = LightState {
            is_on: false,
            r: 4095,
            g: 4095,
            b: 4095,
            w: 4095,
            brightness: 4095,
        };

        assert_eq!(state.output_levels(), [0, 0, 0, 0]);
    }

    #[test]
    fn sanitize_clamps_every_field() {
        let mut state = LightState {
            is_on: true,
            r: 9000,
            g: 4096,
            b: 12,
            w: u16::MAX,
            brightness: 5000,
        };
        state.sanitize();

        assert_eq!(
            state,
            LightState {
                is_on: true,
                r: 4095,
                g: 4095,
                b: 12,
                w: 4095,
                brightness: 4095,
            }
        );
    }
}
