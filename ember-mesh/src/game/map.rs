//! Map Catalog
//!
//! Arena bounds and spawn points. Platform geometry lives with the
//! physics collaborator; this layer only needs what bounds validation and
//! spawning consult.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Arena width in world units.
pub const MAP_WIDTH: f32 = 2000.0;

/// Arena height in world units.
pub const MAP_HEIGHT: f32 = 1200.0;

/// Map used when a requested id is unknown.
pub const DEFAULT_MAP_ID: &str = "ember";

/// Playable area. Positions are valid on `[0, width] x [0, height]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    /// Width in world units.
    pub width: f32,
    /// Height in world units.
    pub height: f32,
}

impl MapBounds {
    /// Create bounds.
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// Check that an x coordinate lies inside the arena.
    #[inline]
    pub fn contains_x(&self, x: f32) -> bool {
        (0.0..=self.width).contains(&x)
    }

    /// Check that a y coordinate lies inside the arena.
    #[inline]
    pub fn contains_y(&self, y: f32) -> bool {
        (0.0..=self.height).contains(&y)
    }

    /// Check that a point lies inside the arena.
    #[inline]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.contains_x(x) && self.contains_y(y)
    }
}

impl Default for MapBounds {
    fn default() -> Self {
        Self::new(MAP_WIDTH, MAP_HEIGHT)
    }
}

/// A spawn location.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
}

/// One selectable map layout.
#[derive(Clone, Debug, PartialEq)]
pub struct MapDefinition {
    /// Stable identifier carried in match settings.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Playable area.
    pub bounds: MapBounds,
    /// Spawn locations (never empty).
    pub spawn_points: Vec<SpawnPoint>,
}

impl MapDefinition {
    /// Pick a random spawn point.
    pub fn random_spawn<R: Rng + ?Sized>(&self, rng: &mut R) -> SpawnPoint {
        if self.spawn_points.is_empty() {
            return SpawnPoint { x: self.bounds.width / 2.0, y: self.bounds.height / 2.0 };
        }
        self.spawn_points[rng.gen_range(0..self.spawn_points.len())]
    }
}

/// The set of maps a session can load.
#[derive(Clone, Debug)]
pub struct MapCatalog {
    maps: Vec<MapDefinition>,
}

impl MapCatalog {
    /// Build a catalog from definitions. Falls back to the built-in maps
    /// when `maps` is empty.
    pub fn new(maps: Vec<MapDefinition>) -> Self {
        if maps.is_empty() {
            return Self::builtin();
        }
        Self { maps }
    }

    /// The three stock arenas.
    pub fn builtin() -> Self {
        let w = MAP_WIDTH;
        let h = MAP_HEIGHT;
        let def = |id: &str, name: &str, points: &[(f32, f32)]| MapDefinition {
            id: id.to_string(),
            name: name.to_string(),
            bounds: MapBounds::new(w, h),
            spawn_points: points.iter().map(|&(x, y)| SpawnPoint { x, y }).collect(),
        };

        Self {
            maps: vec![
                def("ember", "Ember Arena", &[
                    (100.0, h - 150.0),
                    (w - 100.0, h - 150.0),
                    (w / 2.0, h - 150.0),
                    (200.0, h - 450.0),
                    (w - 200.0, h - 450.0),
                ]),
                def("frost", "Frostbite Ridge", &[
                    (150.0, h - 150.0),
                    (w - 150.0, h - 150.0),
                    (w / 2.0 - 450.0, h - 320.0),
                    (w / 2.0 + 450.0, h - 320.0),
                    (w / 2.0, h - 550.0),
                ]),
                def("vault", "Neon Vault", &[
                    (120.0, h - 200.0),
                    (w - 120.0, h - 200.0),
                    (w / 2.0 - 300.0, h - 400.0),
                    (w / 2.0 + 300.0, h - 400.0),
                    (w / 2.0, h - 750.0),
                    (w / 2.0, h - 1000.0),
                ]),
            ],
        }
    }

    /// Look up a map, falling back to the first one for unknown ids.
    pub fn get(&self, id: &str) -> &MapDefinition {
        self.maps.iter().find(|m| m.id == id).unwrap_or(&self.maps[0])
    }

    /// Whether the catalog knows this id.
    pub fn contains(&self, id: &str) -> bool {
        self.maps.iter().any(|m| m.id == id)
    }

    /// All map ids in catalog order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.maps.iter().map(|m| m.id.as_str())
    }
}

impl Default for MapCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
