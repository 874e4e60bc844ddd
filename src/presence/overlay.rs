use ahash::AHashMap;
use sha2::{Digest, Sha256};

use super::{PresenceChange, PresenceKind, PresenceValue};
use crate::crdt::SiteId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Stable overlay colour for a site, the same on every replica.
pub fn color_for(site: &SiteId) -> Color {
    let mut hasher = Sha256::new();
    hasher.update(site.get().to_be_bytes());
    let digest = hasher.finalize();

    // keep every channel away from black so overlays stay readable
    let lift = |byte: u8| 64 + byte / 4 * 3;
    Color {
        r: lift(digest[0]),
        g: lift(digest[1]),
        b: lift(digest[2]),
    }
}

/// The editor widget side of presence: draws decorations at document
/// positions or screen coordinates.
pub trait OverlayRenderer {
    type Handle;

    fn create(
        &mut self,
        site: &SiteId,
        color: Color,
        value: &PresenceValue,
    ) -> Self::Handle;

    fn update(&mut self, handle: &mut Self::Handle, value: &PresenceValue);

    fn remove(&mut self, handle: Self::Handle);
}

/// Joins presence data to renderer handles, one per (site, kind).
pub struct OverlayRegistry<R: OverlayRenderer> {
    renderer: R,
    handles: AHashMap<(SiteId, PresenceKind), R::Handle>,
}

impl<R: OverlayRenderer> OverlayRegistry<R> {
    pub fn new(renderer: R) -> Self {
        Self {
            renderer,
            handles: AHashMap::new(),
        }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn apply(&mut self, change: &PresenceChange) {
        match change {
            PresenceChange::Added { site, value } | PresenceChange::Updated { site, value } => {
                match self.handles.get_mut(&(*site, value.kind())) {
                    Some(handle) => self.renderer.update(handle, value),
                    None => {
                        let handle = self.renderer.create(site, color_for(site), value);
                        self.handles.insert((*site, value.kind()), handle);
                    }
                }
            }
            PresenceChange::Removed { site, kind } => {
                if let Some(handle) = self.handles.remove(&(*site, *kind)) {
                    self.renderer.remove(handle);
                }
            }
        }
    }
}

/// Headless renderer that logs overlay changes
#[derive(Debug, Default)]
pub struct LogRenderer;

impl OverlayRenderer for LogRenderer {
    type Handle = (SiteId, Color);

    fn create(&mut self, site: &SiteId, color: Color, value: &PresenceValue) -> Self::Handle {
        tracing::info!(%site, color = %color.hex(), ?value, "overlay created");
        (*site, color)
    }

    fn update(&mut self, handle: &mut Self::Handle, value: &PresenceValue) {
        tracing::debug!(site = %handle.0, ?value, "overlay moved");
    }

    fn remove(&mut self, handle: Self::Handle) {
        tracing::info!(site = %handle.0, "overlay removed");
    }
}
