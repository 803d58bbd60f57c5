//! Window rectangles in protocol units

use serde::{Deserialize, Serialize};

/// Position inside the parent plus size, as the X protocol carries them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(x: i16, y: i16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle of the given size anchored at the origin
    pub fn sized(width: u16, height: u16) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Same size, origin moved to zero
    pub fn client(&self) -> Self {
        Self::sized(self.width, self.height)
    }

    /// X refuses zero sized windows, so creation clamps to 1x1
    pub(crate) fn creatable(&self) -> Self {
        Self {
            width: self.width.max(1),
            height: self.height.max(1),
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_rect_drops_origin() {
        let r = Rect::new(10, -4, 300, 200);
        assert_eq!(r.client(), Rect::new(0, 0, 300, 200));
    }

    #[test]
    fn test_creatable_clamps_empty_size() {
        let r = Rect::new(5, 5, 0, 0).creatable();
        assert_eq!((r.x, r.y, r.width, r.height), (5, 5, 1, 1));

        let r = Rect::sized(64, 48).creatable();
        assert_eq!(r, Rect::sized(64, 48));
    }
}
