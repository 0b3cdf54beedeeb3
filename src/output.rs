// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Per-output presentation state.

use x11rb::protocol::{xfixes, xproto};

use crate::render::RenderTarget;

/// How many damage rectangles an output tracks individually before
/// collapsing to a whole-window copy.
pub const DAMAGE_CAPACITY: usize = 16;

/// Damage accumulated on an output since its last copy to the front buffer.
///
/// Rectangles past the capacity are not stored, but the count keeps
/// incrementing; an over-capacity count is the signal to copy the whole
/// window instead.
#[derive(Debug, Clone, Copy)]
pub struct DamageRecord {
    rects: [xproto::Rectangle; DAMAGE_CAPACITY],
    count: usize,
}

impl Default for DamageRecord {
    fn default() -> Self {
        let empty = xproto::Rectangle {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
        };

        Self {
            rects: [empty; DAMAGE_CAPACITY],
            count: 0,
        }
    }
}

/// The rectangles a repaint copy should cover.
#[derive(Debug, Clone, Copy)]
pub enum CopyScope<'a> {
    /// Copy exactly these rectangles.
    Precise(&'a [xproto::Rectangle]),
    /// Too many rectangles accumulated; copy the whole window.
    Whole,
}

// The wire Rectangle doesn't compare.
pub(crate) fn rect_fields(rect: &xproto::Rectangle) -> (i16, i16, u16, u16) {
    (rect.x, rect.y, rect.width, rect.height)
}

impl PartialEq for CopyScope<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Whole, Self::Whole) => true,
            (Self::Precise(a), Self::Precise(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(a, b)| rect_fields(a) == rect_fields(b))
            }
            _ => false,
        }
    }
}

impl Eq for CopyScope<'_> {}

impl DamageRecord {
    pub fn record(&mut self, rect: xproto::Rectangle) {
        if self.count < DAMAGE_CAPACITY {
            self.rects[self.count] = rect;
        }

        self.count = self.count.saturating_add(1);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    pub fn scope(&self) -> CopyScope<'_> {
        if self.count <= DAMAGE_CAPACITY {
            CopyScope::Precise(&self.rects[..self.count])
        } else {
            CopyScope::Whole
        }
    }
}

/// A host window presenting one compositor output, together with its imported
/// back buffer and accumulated damage.
pub struct Output {
    pub window: xproto::Window,
    /// An xfixes region covering the whole window, used for full-frame
    /// copies.
    pub region: xfixes::Region,
    pub width: u16,
    pub height: u16,
    pub target: RenderTarget,
    pub damage: DamageRecord,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::{assert_eq, assert_ne};

    use super::*;

    fn rect(x: i16, y: i16) -> xproto::Rectangle {
        xproto::Rectangle {
            x,
            y,
            width: 10,
            height: 10,
        }
    }

    #[test]
    fn test_precise_up_to_capacity() {
        let mut damage = DamageRecord::default();
        assert!(damage.is_empty());

        for i in 0..DAMAGE_CAPACITY {
            damage.record(rect(i as i16, 0));
        }

        assert_eq!(damage.count(), DAMAGE_CAPACITY);
        match damage.scope() {
            CopyScope::Precise(rects) => {
                assert_eq!(rects.len(), DAMAGE_CAPACITY);
                assert_eq!(rect_fields(&rects[0]), rect_fields(&rect(0, 0)));
                assert_eq!(
                    rect_fields(&rects[DAMAGE_CAPACITY - 1]),
                    rect_fields(&rect((DAMAGE_CAPACITY - 1) as i16, 0))
                );
            }
            CopyScope::Whole => panic!("should still be precise at capacity"),
        }
    }

    #[test]
    fn test_overflow_collapses_to_whole() {
        let mut damage = DamageRecord::default();
        for i in 0..(DAMAGE_CAPACITY + 1) {
            damage.record(rect(i as i16, 0));
        }

        assert_eq!(damage.count(), DAMAGE_CAPACITY + 1);
        assert_eq!(damage.scope(), CopyScope::Whole);
    }

    #[test]
    fn test_scope_comparison() {
        let a = [rect(0, 0)];
        let b = [rect(1, 0)];

        assert_eq!(CopyScope::Precise(&a[..]), CopyScope::Precise(&a[..]));
        assert_ne!(CopyScope::Precise(&a[..]), CopyScope::Precise(&b[..]));
        assert_ne!(CopyScope::Precise(&a[..]), CopyScope::Whole);
        assert_eq!(CopyScope::Whole, CopyScope::Whole);
    }

    #[test]
    fn test_clear_resets_scope() {
        let mut damage = DamageRecord::default();
        for i in 0..(DAMAGE_CAPACITY * 2) {
            damage.record(rect(i as i16, 0));
        }

        damage.clear();

        assert!(damage.is_empty());
        assert_eq!(damage.scope(), CopyScope::Precise(&[]));

        damage.record(rect(5, 5));
        assert_eq!(damage.scope(), CopyScope::Precise(&[rect(5, 5)]));
    }
}
