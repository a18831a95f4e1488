//! Opaque hypervisor object references.
//!
//! Handles are passed through untouched; the only thing ever read out of
//! them is the reference string itself.

use std::fmt;

macro_rules! opaque_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(reference: impl Into<String>) -> Self {
                Self(reference.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_ref!(
    /// A virtual machine, snapshot or template.
    VmRef
);
opaque_ref!(
    /// A virtual disk image.
    VdiRef
);
opaque_ref!(
    /// A storage repository.
    SrRef
);
opaque_ref!(
    /// A virtual network.
    NetworkRef
);
opaque_ref!(
    /// A virtual network interface.
    VifRef
);

/// A network interface as attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vif {
    pub reference: VifRef,
    /// Interface index inside the guest; 0 is the management interface.
    pub device: u32,
    pub network: NetworkRef,
}

/// How a disk is presented to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbdKind {
    Disk,
    Cd,
}
