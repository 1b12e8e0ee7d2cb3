//! Host-owned opaque data object (§3 "User-data").

use super::header::{Header, ObjectKind};
use std::ptr::NonNull;
use std::rc::Rc;

/// Opaque bytes tagged with a host-defined kind, an optional metatable,
/// and an optional finalizer run once the object becomes unreachable
/// (§3, §4.6 "Finalizers").
#[repr(C)]
pub struct UserData {
    pub header: Header,
    pub tag: u8,
    pub bytes: Box<[u8]>,
    pub metatable: Option<NonNull<Header>>,
    pub destructor: Option<Rc<dyn Fn(&mut [u8])>>,
}

impl UserData {
    pub fn new(tag: u8, bytes: impl Into<Box<[u8]>>, current_white: u8) -> Self {
        Self {
            header: Header::new(ObjectKind::UserData, current_white),
            tag,
            bytes: bytes.into(),
            metatable: None,
            destructor: None,
        }
    }

    pub fn has_destructor(&self) -> bool {
        self.destructor.is_some()
    }

    pub fn run_destructor(&mut self) {
        if let Some(d) = self.destructor.take() {
            d(&mut self.bytes);
        }
    }
}
