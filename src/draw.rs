//! Per-window GL drawing session state

/// What the caller has to do with the GL context after a session transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Outermost begin: make the context current
    Activate,
    /// Outermost end: present and release
    Present,
    /// Outermost stop: release without presenting
    Discard,
    /// Nested or stray call, nothing to do
    None,
}

/// Idle / drawing state with nesting depth
///
/// Painting code may recurse into another paint, so only the outermost
/// begin and the matching outermost end/stop touch the context.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrawSession {
    depth: u32,
}

impl DrawSession {
    pub fn is_drawing(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn begin(&mut self) -> Transition {
        self.depth += 1;
        if self.depth == 1 {
            Transition::Activate
        } else {
            Transition::None
        }
    }

    pub fn end(&mut self) -> Transition {
        self.leave(Transition::Present)
    }

    pub fn stop(&mut self) -> Transition {
        self.leave(Transition::Discard)
    }

    /// Undo a begin whose context activation failed
    pub fn abort(&mut self) {
        self.depth = 0;
    }

    fn leave(&mut self, outermost: Transition) -> Transition {
        match self.depth {
            0 => Transition::None,
            1 => {
                self.depth = 0;
                outermost
            }
            _ => {
                self.depth -= 1;
                Transition::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_session() {
        let mut s = DrawSession::default();
        assert_eq!(s.begin(), Transition::Activate);
        assert!(s.is_drawing());
        assert_eq!(s.end(), Transition::Present);
        assert!(!s.is_drawing());
    }

    #[test]
    fn test_nested_paint_only_outermost_presents() {
        let mut s = DrawSession::default();
        assert_eq!(s.begin(), Transition::Activate);
        assert_eq!(s.begin(), Transition::None);
        assert_eq!(s.depth(), 2);
        assert_eq!(s.end(), Transition::None);
        assert_eq!(s.stop(), Transition::Discard);
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn test_end_while_idle_is_ignored() {
        let mut s = DrawSession::default();
        assert_eq!(s.end(), Transition::None);
        assert_eq!(s.stop(), Transition::None);
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn test_abort_resets() {
        let mut s = DrawSession::default();
        s.begin();
        s.begin();
        s.abort();
        assert!(!s.is_drawing());
        assert_eq!(s.begin(), Transition::Activate);
    }
}
