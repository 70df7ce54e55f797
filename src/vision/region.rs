use serde::{Deserialize, Serialize};

/// Axis-aligned screen rectangle in absolute pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Point-in-rectangle test, inclusive on every edge.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (x, y) = (i64::from(x), i64::from(y));
        let left = i64::from(self.x);
        let top = i64::from(self.y);
        x >= left
            && x <= left + i64::from(self.width)
            && y >= top
            && y <= top + i64::from(self.height)
    }

    pub fn center(&self) -> (i32, i32) {
        let cx = i64::from(self.x) + i64::from(self.width / 2);
        let cy = i64::from(self.y) + i64::from(self.height / 2);
        (clamp_to_i32(cx), clamp_to_i32(cy))
    }

    /// A `width`×`height` box centred on a point and shifted back inside a
    /// `screen`-sized surface. Oversized boxes shrink to the screen.
    pub fn centered_on(x: i32, y: i32, width: u32, height: u32, screen: (u32, u32)) -> Option<Self> {
        let (screen_w, screen_h) = screen;
        if screen_w == 0 || screen_h == 0 {
            return None;
        }

        let width = width.clamp(1, screen_w);
        let height = height.clamp(1, screen_h);
        let left = (i64::from(x) - i64::from(width / 2)).clamp(0, i64::from(screen_w - width));
        let top = (i64::from(y) - i64::from(height / 2)).clamp(0, i64::from(screen_h - height));

        Some(Self::new(left as u32, top as u32, width, height))
    }

    /// Intersection with a `screen`-sized surface; `None` when nothing is left.
    pub fn clip_to(&self, screen: (u32, u32)) -> Option<Self> {
        let right = self.x.saturating_add(self.width).min(screen.0);
        let bottom = self.y.saturating_add(self.height).min(screen.1);
        if self.x >= right || self.y >= bottom {
            return None;
        }
        Some(Self::new(self.x, self.y, right - self.x, bottom - self.y))
    }
}

fn clamp_to_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
