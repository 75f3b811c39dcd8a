//! Manifest rendering seam

use berth_core::{Chart, ReleaseInfo, Values};
use berth_engine::Engine;

use crate::error::Result;

/// Turns a chart, user values and release information into a manifest
///
/// Implementations must be deterministic: identical inputs produce a
/// byte-identical manifest, which is what upgrade detection compares.
pub trait Renderer: Send + Sync {
    fn render(&self, chart: &Chart, values: &Values, release: &ReleaseInfo) -> Result<String>;
}

impl Renderer for Engine {
    fn render(&self, chart: &Chart, values: &Values, release: &ReleaseInfo) -> Result<String> {
        Ok(self.render_chart(chart, values, release)?)
    }
}
