/*!
Zone membership with hysteresis.

A zone keeps the slots it currently tracks together with a last-seen
timestamp. Targets enter only through the polygon itself. Once tracked, a
target is kept while it stays within `margin` of the perimeter, and while it
reports absence for no longer than `target_timeout_ms`.
*/

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::config::ZoneConfig;
use crate::error::RadarError;
use crate::geometry::{self, Point};
use crate::target::Target;

/// Function producing a replacement polygon at a fixed interval
pub type TemplatePolygon = Box<dyn FnMut() -> Vec<Point> + Send>;

/// Physical area in which targets are tracked, described by a convex polygon
pub struct Zone {
    name: String,
    polygon: Vec<Point>,
    margin: u32,
    target_timeout_ms: u64,
    tracked_targets: BTreeMap<usize, u64>,
    template_polygon: Option<TemplatePolygon>,
    template_evaluation_interval_ms: u64,
    last_template_evaluation: Option<u64>,
}

impl Zone {
    pub fn new(name: impl Into<String>, polygon: Vec<Point>) -> Self {
        let defaults = ZoneConfig::default();
        let zone = Self {
            name: name.into(),
            polygon,
            margin: defaults.margin,
            target_timeout_ms: defaults.target_timeout_ms,
            tracked_targets: BTreeMap::new(),
            template_polygon: None,
            template_evaluation_interval_ms: defaults.template_evaluation_interval_ms,
            last_template_evaluation: None,
        };
        if !zone.is_valid() {
            warn!("Zone '{}' has an invalid polygon and will never be occupied", zone.name);
        }
        zone
    }

    pub fn from_config(config: &ZoneConfig) -> Self {
        let polygon = config.polygon.iter().copied().map(Point::from).collect();
        let mut zone = Self::new(config.name.clone(), polygon);
        zone.margin = config.margin;
        zone.target_timeout_ms = config.target_timeout_ms;
        zone.template_evaluation_interval_ms = config.template_evaluation_interval_ms;
        zone
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn polygon(&self) -> &[Point] {
        &self.polygon
    }

    /// Whether the current polygon can be used for membership tests
    pub fn is_valid(&self) -> bool {
        geometry::is_convex(&self.polygon)
    }

    pub fn margin(&self) -> u32 {
        self.margin
    }

    pub fn set_margin(&mut self, margin: u32) {
        self.margin = margin;
    }

    pub fn target_timeout_ms(&self) -> u64 {
        self.target_timeout_ms
    }

    pub fn set_target_timeout(&mut self, timeout_ms: u64) {
        self.target_timeout_ms = timeout_ms;
    }

    /// Replace the polygon. Non-convex polygons are rejected and the previous one is kept.
    pub fn update_polygon(&mut self, polygon: Vec<Point>) -> bool {
        if !geometry::is_convex(&polygon) {
            let err = RadarError::invalid_polygon(format!("{} points, not convex", polygon.len()));
            debug!("Zone '{}': {}", self.name, err);
            return false;
        }
        self.polygon = polygon;
        true
    }

    /// Install a template polygon evaluated every `interval_ms` (0 disables evaluation)
    pub fn set_template_polygon(&mut self, template: TemplatePolygon, interval_ms: u64) {
        self.template_polygon = Some(template);
        self.template_evaluation_interval_ms = interval_ms;
    }

    /// Evaluate the template polygon now. False if none is set or its result is invalid.
    pub fn evaluate_template_polygon(&mut self) -> bool {
        let Some(template) = self.template_polygon.as_mut() else {
            return false;
        };
        let polygon = template();
        self.update_polygon(polygon)
    }

    pub fn is_occupied(&self) -> bool {
        !self.tracked_targets.is_empty()
    }

    pub fn target_count(&self) -> usize {
        self.tracked_targets.len()
    }

    /// Slots currently tracked inside this zone
    pub fn tracked_slots(&self) -> Vec<usize> {
        self.tracked_targets.keys().copied().collect()
    }

    pub fn last_seen(&self, slot: usize) -> Option<u64> {
        self.tracked_targets.get(&slot).copied()
    }

    /// Re-evaluate membership of every target
    pub fn update(&mut self, targets: &[Target], sensor_available: bool, now_ms: u64) {
        if self.template_evaluation_interval_ms != 0 && self.template_polygon.is_some() {
            let due = self
                .last_template_evaluation
                .map_or(true, |last| now_ms.saturating_sub(last) > self.template_evaluation_interval_ms);
            if due {
                self.last_template_evaluation = Some(now_ms);
                self.evaluate_template_polygon();
            }
        }

        if !sensor_available || !self.is_valid() {
            self.tracked_targets.clear();
            return;
        }

        for (slot, target) in targets.iter().enumerate() {
            self.contains_target(slot, target, now_ms);
        }
    }

    /// Update tracking for one slot; true while the slot counts as inside
    fn contains_target(&mut self, slot: usize, target: &Target, now_ms: u64) -> bool {
        let last_seen = self.tracked_targets.get(&slot).copied();

        if !target.is_present(now_ms) {
            return match last_seen {
                None => false,
                // Did not leave through the boundary: keep it until the timeout runs out
                Some(seen) if now_ms.saturating_sub(seen) > self.target_timeout_ms => {
                    self.tracked_targets.remove(&slot);
                    false
                }
                Some(_) => true,
            };
        }

        let location = geometry::locate(&self.polygon, Point::from(target.position()), last_seen.is_some());

        if location.inside {
            self.tracked_targets.insert(slot, now_ms);
            return true;
        }

        if last_seen.is_some() {
            let within_margin = location.min_distance.map_or(false, |d| d <= self.margin as f64);
            if within_margin {
                return true;
            }
            self.tracked_targets.remove(&slot);
        }
        false
    }

    /// Log the zone configuration
    pub fn dump_config(&self) {
        info!("Zone: {}", self.name);
        info!("  polygon_size: {}", self.polygon.len());
        info!("  polygon valid: {}", self.is_valid());
        if self.template_polygon.is_some() {
            info!("  template polygon defined");
            info!("  template polygon update interval: {}", self.template_evaluation_interval_ms);
        }
        info!("  margin: {} mm", self.margin);
        info!("  target_timeout: {} ms", self.target_timeout_ms);
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("name", &self.name)
            .field("polygon", &self.polygon)
            .field("margin", &self.margin)
            .field("target_timeout_ms", &self.target_timeout_ms)
            .field("tracked_targets", &self.tracked_targets)
            .field("template_polygon", &self.template_polygon.is_some())
            .finish()
    }
}
