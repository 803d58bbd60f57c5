//! The small fixed set of atoms the toolkit itself needs
//!
//! ICCCM close handshake (`WM_PROTOCOLS` / `WM_DELETE_WINDOW`) and the XEmbed
//! info property.

use x11rb::connection::Connection;
use x11rb::cookie::Cookie;
use x11rb::protocol::xproto::{Atom, ConnectionExt as _, InternAtomReply};

use crate::error::Result;

/// Atoms cached by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommonAtom {
    WmProtocols,
    WmDeleteWindow,
    XembedInfo,
}

impl CommonAtom {
    pub const ALL: [CommonAtom; 3] = [
        CommonAtom::WmProtocols,
        CommonAtom::WmDeleteWindow,
        CommonAtom::XembedInfo,
    ];

    /// Protocol name of the atom
    pub fn name(self) -> &'static str {
        match self {
            CommonAtom::WmProtocols => "WM_PROTOCOLS",
            CommonAtom::WmDeleteWindow => "WM_DELETE_WINDOW",
            CommonAtom::XembedInfo => "_XEMBED_INFO",
        }
    }

    fn index(self) -> usize {
        match self {
            CommonAtom::WmProtocols => 0,
            CommonAtom::WmDeleteWindow => 1,
            CommonAtom::XembedInfo => 2,
        }
    }
}

/// Interned common atoms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Atoms {
    ids: [Atom; CommonAtom::ALL.len()],
}

impl Atoms {
    /// Intern all common atoms with a single round trip
    pub fn intern<C: Connection>(conn: &C) -> Result<Self> {
        // Send every request before waiting on the first reply
        let cookies: Vec<Cookie<'_, C, InternAtomReply>> = CommonAtom::ALL
            .iter()
            .map(|atom| conn.intern_atom(false, atom.name().as_bytes()))
            .collect::<std::result::Result<_, _>>()?;

        let mut ids = [0; CommonAtom::ALL.len()];
        for (slot, cookie) in ids.iter_mut().zip(cookies) {
            *slot = cookie.reply()?.atom;
        }
        Ok(Self { ids })
    }

    pub fn get(&self, atom: CommonAtom) -> Atom {
        self.ids[atom.index()]
    }

    #[cfg(test)]
    pub(crate) fn from_ids(ids: [Atom; 3]) -> Self {
        Self { ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_lookup_follows_enumeration() {
        let atoms = Atoms::from_ids([301, 302, 303]);
        assert_eq!(atoms.get(CommonAtom::WmProtocols), 301);
        assert_eq!(atoms.get(CommonAtom::WmDeleteWindow), 302);
        assert_eq!(atoms.get(CommonAtom::XembedInfo), 303);
    }

    #[test]
    fn test_atom_names() {
        let names: Vec<_> = CommonAtom::ALL.iter().map(|a| a.name()).collect();
        assert_eq!(names, ["WM_PROTOCOLS", "WM_DELETE_WINDOW", "_XEMBED_INFO"]);
    }
}
