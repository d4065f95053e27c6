//! Reconciles rendered map markers against published pin sets.

use std::collections::BTreeMap;

use civic_map_report_models::Pin;
use tokio::sync::watch;

use crate::ViewportSnapshot;

/// The map library markers are drawn on.
pub trait MapSurface {
    /// Handle to a marker on the map.
    type Marker;

    /// Draws a marker for `pin`.
    fn add_marker(&mut self, pin: &Pin) -> Self::Marker;

    /// Removes a marker previously returned by [`Self::add_marker`].
    fn remove_marker(&mut self, marker: Self::Marker);
}

/// What a reconciliation changed, by report id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDiff {
    /// Markers created for pins that were not rendered.
    pub added: Vec<String>,
    /// Markers redrawn because urgency or position changed.
    pub replaced: Vec<String>,
    /// Markers removed because their pin left the set.
    pub removed: Vec<String>,
    /// Markers left untouched.
    pub kept: usize,
}

impl SyncDiff {
    /// Whether the map was touched at all.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }
}

struct Rendered<M> {
    pin: Pin,
    marker: M,
}

/// Owns the markers drawn on a [`MapSurface`].
///
/// Every marker this drew is removed again by [`Self::clear`] or on drop,
/// so no marker outlives the component that rendered it.
pub struct MarkerSync<S: MapSurface> {
    surface: S,
    rendered: BTreeMap<String, Rendered<S::Marker>>,
}

impl<S: MapSurface> MarkerSync<S> {
    /// Starts with nothing rendered.
    pub const fn new(surface: S) -> Self {
        Self {
            surface,
            rendered: BTreeMap::new(),
        }
    }

    /// Brings the map in line with `pins` using the least churn.
    ///
    /// Unchanged pins keep their marker. All removals, including the old
    /// half of a replacement, run before any marker is added. When `pins`
    /// repeats an id the last occurrence wins.
    pub fn reconcile(&mut self, pins: &[Pin]) -> SyncDiff {
        let incoming: BTreeMap<&str, &Pin> =
            pins.iter().map(|pin| (pin.report_id.as_str(), pin)).collect();
        let mut diff = SyncDiff::default();

        let stale: Vec<String> = self
            .rendered
            .iter()
            .filter(|(id, rendered)| {
                incoming
                    .get(id.as_str())
                    .is_none_or(|pin| **pin != rendered.pin)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            let Some(rendered) = self.rendered.remove(&id) else {
                continue;
            };
            self.surface.remove_marker(rendered.marker);
            if incoming.contains_key(id.as_str()) {
                diff.replaced.push(id);
            } else {
                diff.removed.push(id);
            }
        }

        for (id, pin) in incoming {
            if self.rendered.contains_key(id) {
                diff.kept += 1;
                continue;
            }
            let marker = self.surface.add_marker(pin);
            self.rendered.insert(
                id.to_string(),
                Rendered {
                    pin: pin.clone(),
                    marker,
                },
            );
            if !diff.replaced.iter().any(|replaced| replaced == id) {
                diff.added.push(id.to_string());
            }
        }

        log::debug!(
            "Markers: +{} ~{} -{} ={}",
            diff.added.len(),
            diff.replaced.len(),
            diff.removed.len(),
            diff.kept
        );
        diff
    }

    /// Reconciles every snapshot published on `snapshots` until the
    /// publisher goes away.
    pub async fn drive(&mut self, mut snapshots: watch::Receiver<ViewportSnapshot>) {
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                self.reconcile(&snapshot.pins);
            }
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    }

    /// Removes every rendered marker.
    pub fn clear(&mut self) -> usize {
        let rendered = std::mem::take(&mut self.rendered);
        let count = rendered.len();
        for (_, rendered) in rendered {
            self.surface.remove_marker(rendered.marker);
        }
        count
    }

    /// Ids with a marker on the map, in ascending order.
    #[must_use]
    pub fn rendered_ids(&self) -> Vec<&str> {
        self.rendered.keys().map(String::as_str).collect()
    }

    /// Number of rendered markers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rendered.len()
    }

    /// Whether nothing is rendered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rendered.is_empty()
    }

    /// The underlying map.
    #[must_use]
    pub const fn surface(&self) -> &S {
        &self.surface
    }
}

impl<S: MapSurface> Drop for MarkerSync<S> {
    fn drop(&mut self) {
        let removed = self.clear();
        if removed > 0 {
            log::debug!("Removed {removed} markers on drop");
        }
    }
}
