//! Rectangle layout for the chart workspace.
//!
//! Every key in the synced set shares one width. The two code editor panels
//! are exempt and keep whatever width they were given. Anything else (custom
//! panels, the auxiliary panel) passes through reconciliation untouched.
//! Membership never follows from a key's name: it only changes through
//! [`LayoutSync::register_key`] and friends.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const CHART_KEY: &str = "chart";
pub const INDICATOR_EDITOR_KEY: &str = "panel-indicator-editor";
pub const STRATEGY_EDITOR_KEY: &str = "panel-strategy-editor";
pub const AUXILIARY_KEY: &str = "aux";

pub const DEFAULT_SHARED_WIDTH: u32 = 16;
pub const DEFAULT_EDITOR_WIDTH: u32 = 8;
pub const DEFAULT_SYNCED_HEIGHT: u32 = 6;

/// How reconciliation treats a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelMembership {
    /// Width forced to the shared width.
    Synced,
    /// Keeps its own width.
    Exempt,
    Standalone,
}

/// One grid rectangle. Width and height may be unset until reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutRect {
    #[serde(alias = "i")]
    pub key: String,
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_h: Option<u32>,
}

impl LayoutRect {
    pub fn new(key: impl Into<String>, x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            key: key.into(),
            x,
            y,
            w: Some(w),
            h: Some(h),
            min_h: None,
            min_w: None,
            max_h: None,
        }
    }

    /// A rect with only a position; size comes from reconciliation.
    pub fn without_size(key: impl Into<String>, x: u32, y: u32) -> Self {
        Self {
            key: key.into(),
            x,
            y,
            w: None,
            h: None,
            min_h: None,
            min_w: None,
            max_h: None,
        }
    }

    pub fn with_bounds(mut self, min_w: u32, min_h: u32, max_h: u32) -> Self {
        self.min_w = Some(min_w);
        self.min_h = Some(min_h);
        self.max_h = Some(max_h);
        self
    }

    /// The fixed rect shown while the auxiliary panel is toggled on.
    pub fn auxiliary() -> Self {
        Self::new(AUXILIARY_KEY, 8, 21, 8, 17).with_bounds(4, 8, 30)
    }

    fn apply(&mut self, patch: &RectPatch) {
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(w) = patch.w {
            self.w = Some(w);
        }
        if let Some(h) = patch.h {
            self.h = Some(h);
        }
        if let Some(v) = patch.min_h {
            self.min_h = Some(v);
        }
        if let Some(v) = patch.min_w {
            self.min_w = Some(v);
        }
        if let Some(v) = patch.max_h {
            self.max_h = Some(v);
        }
    }
}

/// Partial update for one rect; `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_h: Option<u32>,
}

impl RectPatch {
    pub fn width(w: u32) -> Self {
        Self {
            w: Some(w),
            ..Self::default()
        }
    }

    pub fn position(x: u32, y: u32) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn with_height(mut self, h: u32) -> Self {
        self.h = Some(h);
        self
    }
}

/// Serializable copy of the synchronizer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSnapshot {
    pub synced: Vec<String>,
    #[serde(default)]
    pub exempt: Vec<String>,
    pub shared_width: u32,
    #[serde(default)]
    pub rects: Vec<LayoutRect>,
    #[serde(default)]
    pub custom_panels: Vec<LayoutRect>,
    #[serde(default)]
    pub auxiliary_visible: bool,
}

/// Owns the layout rects and keeps synced widths equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSync {
    synced: BTreeSet<String>,
    exempt: BTreeSet<String>,
    shared_width: u32,
    rects: Vec<LayoutRect>,
    custom_panels: Vec<LayoutRect>,
    auxiliary_visible: bool,
}

impl Default for LayoutSync {
    fn default() -> Self {
        Self::new(CHART_KEY, DEFAULT_SHARED_WIDTH)
    }
}

impl LayoutSync {
    /// Starts with exactly one synced key and both editors exempt.
    pub fn new(default_synced_key: impl Into<String>, shared_width: u32) -> Self {
        let mut synced = BTreeSet::new();
        synced.insert(default_synced_key.into());
        let exempt = [INDICATOR_EDITOR_KEY, STRATEGY_EDITOR_KEY]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            synced,
            exempt,
            shared_width,
            rects: Vec::new(),
            custom_panels: Vec::new(),
            auxiliary_visible: false,
        }
    }

    pub fn shared_width(&self) -> u32 {
        self.shared_width
    }

    pub fn rects(&self) -> &[LayoutRect] {
        &self.rects
    }

    pub fn rect(&self, key: &str) -> Option<&LayoutRect> {
        self.rects.iter().find(|r| r.key == key)
    }

    pub fn synced_keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.synced.iter().map(String::as_str)
    }

    pub fn custom_panels(&self) -> &[LayoutRect] {
        &self.custom_panels
    }

    pub fn is_auxiliary_visible(&self) -> bool {
        self.auxiliary_visible
    }

    pub fn membership(&self, key: &str) -> PanelMembership {
        if self.synced.contains(key) {
            PanelMembership::Synced
        } else if self.exempt.contains(key) {
            PanelMembership::Exempt
        } else {
            PanelMembership::Standalone
        }
    }

    pub fn is_synced(&self, key: &str) -> bool {
        self.synced.contains(key)
    }

    /// Move `key` into exactly one membership class. Returns false if it was
    /// already there.
    pub fn register_key(&mut self, key: impl Into<String>, membership: PanelMembership) -> bool {
        let key = key.into();
        if self.membership(&key) == membership {
            return false;
        }
        self.synced.remove(&key);
        self.exempt.remove(&key);
        match membership {
            PanelMembership::Synced => {
                self.synced.insert(key.clone());
            }
            PanelMembership::Exempt => {
                self.exempt.insert(key.clone());
            }
            PanelMembership::Standalone => {}
        }
        debug!(key = %key, ?membership, "panel membership changed");
        let raw = std::mem::take(&mut self.rects);
        self.rects = self.reconcile_layout(raw);
        true
    }

    /// Make `key` standalone. The rect, if any, keeps its current size.
    pub fn unregister_key(&mut self, key: &str) -> bool {
        self.register_key(key, PanelMembership::Standalone)
    }

    pub fn register_synced_panel(&mut self, key: impl Into<String>) -> bool {
        let added = self.register_key(key, PanelMembership::Synced);
        if added {
            info!(synced = self.synced.len(), "synced panel registered");
        }
        added
    }

    pub fn unregister_synced_panel(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if !self.synced.contains(&key) {
            return false;
        }
        self.register_key(key, PanelMembership::Standalone)
    }

    /// Forget a panel entirely: drop its membership and its rect.
    pub fn remove_panel(&mut self, key: &str) -> bool {
        let had_membership = self.synced.remove(key) | self.exempt.remove(key);
        let before = self.rects.len();
        self.rects.retain(|r| r.key != key);
        let removed = had_membership || before != self.rects.len();
        if removed {
            debug!(key, "panel removed");
        }
        removed
    }

    /// Record a new shared width and apply it to every synced rect.
    pub fn set_shared_width(&mut self, width: u32) {
        self.shared_width = width;
        debug!(width, "shared width set");
        let raw = std::mem::take(&mut self.rects);
        self.rects = self.reconcile_layout(raw);
    }

    /// Force synced widths onto `raw` without storing it.
    pub fn reconcile_layout(&self, raw: Vec<LayoutRect>) -> Vec<LayoutRect> {
        raw.into_iter()
            .map(|mut rect| {
                match self.membership(&rect.key) {
                    PanelMembership::Exempt => {
                        rect.w = Some(rect.w.unwrap_or(DEFAULT_EDITOR_WIDTH));
                    }
                    PanelMembership::Synced => {
                        rect.w = Some(self.shared_width);
                        rect.h = Some(rect.h.unwrap_or(DEFAULT_SYNCED_HEIGHT));
                    }
                    PanelMembership::Standalone => {}
                }
                rect
            })
            .collect()
    }

    /// Replace the stored layout with the reconciled form of `raw`.
    pub fn set_layout(&mut self, raw: Vec<LayoutRect>) {
        self.rects = self.reconcile_layout(raw);
    }

    /// Apply `patch` to the rect under `key`. A width change on a synced key
    /// becomes the shared width and resizes every synced rect with it.
    /// Returns false when no rect has that key.
    pub fn update_single_rect(&mut self, key: &str, patch: RectPatch) -> bool {
        let Some(index) = self.rects.iter().position(|r| r.key == key) else {
            return false;
        };

        match patch.w {
            Some(width) if self.synced.contains(key) => {
                self.shared_width = width;
                for rect in &mut self.rects {
                    if self.synced.contains(&rect.key) {
                        rect.w = Some(width);
                    }
                }
                self.rects[index].apply(&patch);
                info!(key, width, "shared width fanned out");
            }
            _ => self.rects[index].apply(&patch),
        }
        true
    }

    /// Show or hide the auxiliary panel. Showing twice never duplicates it.
    pub fn toggle_auxiliary_panel(&mut self, on: bool) {
        self.rects.retain(|r| r.key != AUXILIARY_KEY);
        if on {
            self.rects.push(LayoutRect::auxiliary());
        }
        self.auxiliary_visible = on;
        debug!(on, "auxiliary panel toggled");
    }

    /// Add a standalone panel. Does nothing if a custom panel with that key exists.
    pub fn add_custom_panel(&mut self, rect: LayoutRect) -> bool {
        if self.custom_panels.iter().any(|p| p.key == rect.key) {
            return false;
        }
        self.custom_panels.push(rect.clone());
        self.rects.push(rect);
        true
    }

    pub fn remove_custom_panel(&mut self, key: &str) -> bool {
        let before = self.custom_panels.len();
        self.custom_panels.retain(|p| p.key != key);
        self.rects.retain(|r| r.key != key);
        before != self.custom_panels.len()
    }

    pub fn snapshot(&self) -> LayoutSnapshot {
        LayoutSnapshot {
            synced: self.synced.iter().cloned().collect(),
            exempt: self.exempt.iter().cloned().collect(),
            shared_width: self.shared_width,
            rects: self.rects.clone(),
            custom_panels: self.custom_panels.clone(),
            auxiliary_visible: self.auxiliary_visible,
        }
    }

    /// Rebuild from a snapshot. A key listed both as synced and exempt is synced.
    pub fn restore(snapshot: LayoutSnapshot) -> Self {
        let synced: BTreeSet<String> = snapshot.synced.into_iter().collect();
        let exempt = snapshot
            .exempt
            .into_iter()
            .filter(|k| !synced.contains(k))
            .collect();
        let mut sync = Self {
            synced,
            exempt,
            shared_width: snapshot.shared_width,
            rects: Vec::new(),
            custom_panels: snapshot.custom_panels,
            auxiliary_visible: false,
        };
        sync.set_layout(snapshot.rects);
        sync.toggle_auxiliary_panel(snapshot.auxiliary_visible);
        sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(sync: &LayoutSync) -> Vec<String> {
        sync.rects().iter().map(|r| r.key.clone()).collect()
    }

    fn width(sync: &LayoutSync, key: &str) -> Option<u32> {
        sync.rect(key).and_then(|r| r.w)
    }

    fn abc_with_editor() -> LayoutSync {
        let mut sync = LayoutSync::new("A", 16);
        sync.register_synced_panel("B");
        sync.register_synced_panel("C");
        sync.register_key("E", PanelMembership::Exempt);
        sync.set_layout(vec![
            LayoutRect::new("A", 0, 0, 16, 6),
            LayoutRect::new("B", 0, 6, 16, 6),
            LayoutRect::new("C", 0, 12, 16, 6),
            LayoutRect::new("E", 16, 0, 8, 11),
        ]);
        sync
    }

    #[test]
    fn starts_with_one_synced_key() {
        let sync = LayoutSync::default();
        assert_eq!(sync.synced_keys().collect::<Vec<_>>(), vec![CHART_KEY]);
        assert_eq!(sync.shared_width(), 16);
        assert_eq!(sync.membership(INDICATOR_EDITOR_KEY), PanelMembership::Exempt);
        assert_eq!(sync.membership(STRATEGY_EDITOR_KEY), PanelMembership::Exempt);
        assert_eq!(sync.membership("panel-indicator-1-1"), PanelMembership::Standalone);
    }

    #[test]
    fn dragging_one_synced_panel_resizes_all() {
        let mut sync = abc_with_editor();
        assert!(sync.update_single_rect("A", RectPatch::width(12)));
        assert_eq!(width(&sync, "A"), Some(12));
        assert_eq!(width(&sync, "B"), Some(12));
        assert_eq!(width(&sync, "C"), Some(12));
        assert_eq!(width(&sync, "E"), Some(8));
        assert_eq!(sync.shared_width(), 12);
    }

    #[test]
    fn non_width_patch_touches_only_its_rect() {
        let mut sync = abc_with_editor();
        sync.update_single_rect("B", RectPatch::position(4, 30).with_height(9));
        let b = sync.rect("B").unwrap();
        assert_eq!((b.x, b.y, b.h), (4, 30, Some(9)));
        assert_eq!(sync.rect("A").unwrap().y, 0);
        assert_eq!(sync.rect("C").unwrap().h, Some(6));
    }

    #[test]
    fn exempt_width_change_stays_local() {
        let mut sync = abc_with_editor();
        sync.update_single_rect("E", RectPatch::width(10));
        assert_eq!(width(&sync, "E"), Some(10));
        assert_eq!(width(&sync, "A"), Some(16));
        assert_eq!(sync.shared_width(), 16);
    }

    #[test]
    fn patch_for_missing_key_is_ignored() {
        let mut sync = abc_with_editor();
        let before = sync.clone();
        assert!(!sync.update_single_rect("nope", RectPatch::width(3)));
        assert_eq!(sync, before);
    }

    #[test]
    fn reconcile_defaults_sizes_by_membership() {
        let sync = LayoutSync::new(CHART_KEY, 14);
        let out = sync.reconcile_layout(vec![
            LayoutRect::without_size(CHART_KEY, 0, 0),
            LayoutRect::without_size(INDICATOR_EDITOR_KEY, 0, 50),
            LayoutRect::new(STRATEGY_EDITOR_KEY, 0, 60, 5, 11),
            LayoutRect::without_size("other", 3, 3),
        ]);
        assert_eq!((out[0].w, out[0].h), (Some(14), Some(6)));
        assert_eq!((out[1].w, out[1].h), (Some(8), None));
        assert_eq!((out[2].w, out[2].h), (Some(5), Some(11)));
        assert_eq!(out[3], LayoutRect::without_size("other", 3, 3));
    }

    #[test]
    fn reconcile_keeps_existing_synced_height() {
        let sync = LayoutSync::default();
        let out = sync.reconcile_layout(vec![LayoutRect::new(CHART_KEY, 0, 0, 3, 20)]);
        assert_eq!((out[0].w, out[0].h), (Some(16), Some(20)));
    }

    #[test]
    fn membership_is_explicit_not_by_name() {
        let mut sync = LayoutSync::default();
        sync.set_layout(vec![LayoutRect::new("panel-3-1", 0, 0, 4, 4)]);
        assert_eq!(width(&sync, "panel-3-1"), Some(4));

        assert!(sync.register_synced_panel("panel-3-1"));
        assert!(!sync.register_synced_panel("panel-3-1"));
        assert_eq!(width(&sync, "panel-3-1"), Some(16));

        sync.unregister_key(INDICATOR_EDITOR_KEY);
        assert_eq!(sync.membership(INDICATOR_EDITOR_KEY), PanelMembership::Standalone);
    }

    #[test]
    fn unregistered_panel_keeps_width_and_stops_following() {
        let mut sync = abc_with_editor();
        assert!(sync.unregister_synced_panel("C"));
        assert!(!sync.unregister_synced_panel("C"));
        sync.update_single_rect("A", RectPatch::width(10));
        assert_eq!(width(&sync, "B"), Some(10));
        assert_eq!(width(&sync, "C"), Some(16));
    }

    #[test]
    fn unregister_synced_leaves_exempt_alone() {
        let mut sync = LayoutSync::default();
        assert!(!sync.unregister_synced_panel(INDICATOR_EDITOR_KEY));
        assert_eq!(sync.membership(INDICATOR_EDITOR_KEY), PanelMembership::Exempt);
    }

    #[test]
    fn set_shared_width_skips_editors() {
        let mut sync = abc_with_editor();
        sync.set_shared_width(20);
        assert_eq!(width(&sync, "B"), Some(20));
        assert_eq!(width(&sync, "E"), Some(8));
    }

    #[test]
    fn auxiliary_toggle_round_trips_key_set() {
        let mut sync = abc_with_editor();
        let before = keys(&sync);

        sync.toggle_auxiliary_panel(true);
        sync.toggle_auxiliary_panel(true);
        let aux: Vec<_> = sync.rects().iter().filter(|r| r.key == AUXILIARY_KEY).collect();
        assert_eq!(aux.len(), 1);
        assert_eq!(*aux[0], LayoutRect::auxiliary());
        assert_eq!(width(&sync, "A"), Some(16));

        sync.toggle_auxiliary_panel(false);
        assert_eq!(keys(&sync), before);
        assert!(!sync.is_auxiliary_visible());
    }

    #[test]
    fn remove_panel_drops_membership_and_rect() {
        let mut sync = abc_with_editor();
        assert!(sync.remove_panel("B"));
        assert!(!sync.is_synced("B"));
        assert!(sync.rect("B").is_none());
        assert_eq!(keys(&sync), vec!["A", "C", "E"]);

        sync.set_shared_width(10);
        assert_eq!(width(&sync, "C"), Some(10));
        assert!(!sync.remove_panel("B"));
    }

    #[test]
    fn auxiliary_geometry_is_fixed() {
        let aux = LayoutRect::auxiliary();
        assert_eq!((aux.x, aux.y, aux.w, aux.h), (8, 21, Some(8), Some(17)));
        assert_eq!((aux.min_h, aux.min_w, aux.max_h), (Some(8), Some(4), Some(30)));
    }

    #[test]
    fn custom_panels_add_once_and_remove() {
        let mut sync = LayoutSync::default();
        let rect = LayoutRect::new(INDICATOR_EDITOR_KEY, 0, 50, 8, 11);
        assert!(sync.add_custom_panel(rect.clone()));
        assert!(!sync.add_custom_panel(rect));
        assert_eq!(keys(&sync), vec![INDICATOR_EDITOR_KEY.to_string()]);

        assert!(sync.remove_custom_panel(INDICATOR_EDITOR_KEY));
        assert!(sync.rects().is_empty());
        assert!(sync.custom_panels().is_empty());
        assert!(!sync.remove_custom_panel(INDICATOR_EDITOR_KEY));
    }

    #[test]
    fn snapshot_restores_state() {
        let mut sync = abc_with_editor();
        sync.toggle_auxiliary_panel(true);
        sync.update_single_rect("B", RectPatch::width(11));

        let json = serde_json::to_string(&sync.snapshot()).unwrap();
        let restored = LayoutSync::restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored, sync);
    }

    #[test]
    fn rect_accepts_grid_item_field_names() {
        let rect: LayoutRect =
            serde_json::from_str(r#"{"i":"f","x":8,"y":21,"w":8,"h":17,"minH":8,"minW":4,"maxH":30}"#)
                .unwrap();
        assert_eq!(rect.key, "f");
        assert_eq!(rect.min_h, Some(8));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u8),
        Unregister(u8),
        Resize(u8, u32),
        Move(u8, u32),
        Shared(u32),
        Aux(bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Register),
            (0u8..6).prop_map(Op::Unregister),
            (0u8..8, 1u32..40).prop_map(|(k, w)| Op::Resize(k, w)),
            (0u8..8, 0u32..60).prop_map(|(k, y)| Op::Move(k, y)),
            (1u32..40).prop_map(Op::Shared),
            any::<bool>().prop_map(Op::Aux),
        ]
    }

    fn key_for(n: u8) -> String {
        match n {
            6 => INDICATOR_EDITOR_KEY.to_string(),
            7 => STRATEGY_EDITOR_KEY.to_string(),
            n => format!("panel-indicator-1-{n}"),
        }
    }

    proptest! {
        #[test]
        fn synced_rects_always_share_width(ops in prop::collection::vec(op(), 0..40)) {
            let mut sync = LayoutSync::new("panel-indicator-1-0", 16);
            sync.set_layout((0..8).map(|n| LayoutRect::new(key_for(n), 0, 0, 8, 6)).collect());

            for op in ops {
                match op {
                    Op::Register(n) => { sync.register_synced_panel(key_for(n)); }
                    Op::Unregister(n) => { sync.unregister_synced_panel(key_for(n)); }
                    Op::Resize(n, w) => { sync.update_single_rect(&key_for(n), RectPatch::width(w)); }
                    Op::Move(n, y) => { sync.update_single_rect(&key_for(n), RectPatch::position(0, y)); }
                    Op::Shared(w) => sync.set_shared_width(w),
                    Op::Aux(on) => sync.toggle_auxiliary_panel(on),
                }

                let shared = sync.shared_width();
                for rect in sync.rects() {
                    if sync.is_synced(&rect.key) {
                        prop_assert_eq!(rect.w, Some(shared));
                    }
                }
                let aux = sync.rects().iter().filter(|r| r.key == AUXILIARY_KEY).count();
                prop_assert!(aux <= 1);
            }
        }
    }
}
