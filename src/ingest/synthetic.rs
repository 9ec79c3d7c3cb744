//! Synthetic doorway scene (`stub://` URLs).
//!
//! The scene alternates between an empty porch and a visitor standing in frame. Visitors
//! are drawn bright enough for `BrightRegionDetector` and each one has its own shade and
//! texture, so repeated visits by the same visitor embed alike.
//!
//! URL query knobs: `frames` (stop after N frames), `period` (frames per empty/visitor
//! phase, default 20), `fail_after` (return one read failure after N frames).

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use super::{FrameSource, SourceFailure, SourceSettings};
use crate::frame::{Frame, FrameClock, RGB_CHANNELS};
use crate::now_ms;

const DEFAULT_PERIOD: u64 = 20;
/// Background never reaches the detector's brightness threshold.
const BACKGROUND_MAX: u64 = 96;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub frame_limit: Option<u64>,
    pub period: u64,
    pub fail_after: Option<u64>,
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    clock: FrameClock,
    frame_count: u64,
    next_due: Option<Instant>,
    broken: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        log::info!(
            "SyntheticSource: {} ({}x{}, period {})",
            config.name,
            config.width,
            config.height,
            config.period
        );
        Self {
            config,
            clock: FrameClock::new(),
            frame_count: 0,
            next_due: None,
            broken: false,
        }
    }

    pub fn from_settings(settings: &SourceSettings) -> Result<Self> {
        let rest = settings
            .url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source url must start with stub://"))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut config = SyntheticConfig {
            name: if name.is_empty() { "stub" } else { name }.to_string(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
            frame_limit: None,
            period: DEFAULT_PERIOD,
            fail_after: None,
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub:// parameter '{}'", pair))?;
            let value: u64 = value
                .parse()
                .map_err(|_| anyhow!("stub:// parameter {} must be an integer", key))?;
            match key {
                "frames" => config.frame_limit = Some(value),
                "period" => config.period = value.max(1),
                "fail_after" => config.fail_after = Some(value),
                other => return Err(anyhow!("unknown stub:// parameter '{}'", other)),
            }
        }
        Ok(Self::new(config))
    }

    /// Frames produced so far.
    pub fn frames_produced(&self) -> u64 {
        self.frame_count
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_millis(1000 / u64::from(self.config.target_fps.max(1)));
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + interval);
    }

    fn render(&self) -> Vec<u8> {
        let (width, height) = (self.config.width, self.config.height);
        let mut pixels = vec![0u8; width as usize * height as usize * RGB_CHANNELS];
        for y in 0..height {
            for x in 0..width {
                let shade = ((u64::from(x) + u64::from(y) + self.frame_count) % BACKGROUND_MAX) as u8;
                let o = (y as usize * width as usize + x as usize) * RGB_CHANNELS;
                pixels[o..o + RGB_CHANNELS].copy_from_slice(&[shade / 2, shade, shade / 2]);
            }
        }

        let phase = self.frame_count / self.config.period;
        if phase % 2 == 1 {
            self.draw_visitor(&mut pixels, phase / 2);
        }
        pixels
    }

    fn draw_visitor(&self, pixels: &mut [u8], visitor: u64) {
        let (width, height) = (self.config.width, self.config.height);
        let w = (width / 4).max(1);
        let h = (height / 2).max(1);
        let x0 = (width - w) / 2;
        let y0 = (height - h) / 2;
        let base = 200 + (visitor * 17 % 40) as u8;
        let stripe = (visitor % 4 + 1) as u32;
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                let texture = (((x + y) / stripe) % 2) as u8 * 12;
                let value = base.saturating_add(texture);
                let o = (y as usize * width as usize + x as usize) * RGB_CHANNELS;
                pixels[o..o + RGB_CHANNELS].copy_from_slice(&[value, value, value]);
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn next(&mut self) -> Result<Option<Frame>, SourceFailure> {
        if self.broken {
            return Err(SourceFailure::Read(format!(
                "{}: stream stalled",
                self.config.name
            )));
        }
        if self
            .config
            .fail_after
            .is_some_and(|limit| self.frame_count == limit)
        {
            self.broken = true;
            self.config.fail_after = None;
            return Err(SourceFailure::Read(format!(
                "{}: stream stalled",
                self.config.name
            )));
        }
        if self
            .config
            .frame_limit
            .is_some_and(|limit| self.frame_count >= limit)
        {
            return Ok(None);
        }

        self.pace();
        let pixels = self.render();
        self.frame_count += 1;
        self.clock
            .frame(now_ms(), self.config.width, self.config.height, pixels)
            .map(Some)
            .map_err(|e| SourceFailure::Read(e.to_string()))
    }

    fn reconnect(&mut self) -> Result<(), SourceFailure> {
        log::info!("SyntheticSource: {} reconnected", self.config.name);
        self.broken = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> SourceSettings {
        SourceSettings {
            url: url.to_string(),
            width: 32,
            height: 24,
            target_fps: 0,
        }
    }

    #[test]
    fn frames_are_sequenced_and_limited() -> Result<()> {
        let mut source = SyntheticSource::from_settings(&settings("stub://porch?frames=3"))?;
        let mut ids = Vec::new();
        while let Some(frame) = source.next()? {
            ids.push(frame.sequence_id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn visitor_appears_in_odd_phases() -> Result<()> {
        let mut source = SyntheticSource::from_settings(&settings("stub://porch?period=2"))?;
        let empty = source.next()?.ok_or_else(|| anyhow!("no frame"))?;
        source.next()?;
        let visitor = source.next()?.ok_or_else(|| anyhow!("no frame"))?;
        assert!(empty.pixels().iter().all(|&p| u64::from(p) < BACKGROUND_MAX));
        assert_eq!(visitor.rgb_at(16, 12), [200, 200, 200]);
        Ok(())
    }

    #[test]
    fn failure_is_reported_once_and_reconnect_recovers() -> Result<()> {
        let mut source = SyntheticSource::from_settings(&settings("stub://porch?fail_after=1"))?;
        assert!(source.next()?.is_some());
        assert!(source.next().is_err());
        assert!(source.next().is_err());
        source.reconnect()?;
        let frame = source.next()?.ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!(frame.sequence_id, 2);
        Ok(())
    }

    #[test]
    fn rejects_unknown_parameters() {
        assert!(SyntheticSource::from_settings(&settings("stub://porch?fps=3")).is_err());
    }
}
