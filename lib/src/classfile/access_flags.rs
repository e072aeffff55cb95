use bitflags::bitflags;

bitflags! {
    /// Access flags on classes
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.1-200-E.1
    pub struct ClassAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
    }
}

bitflags! {
    /// Access flags on methods
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.6-200-A.1
    pub struct MethodAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

bitflags! {
    /// Access flags on fields
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.5-200-A.1
    pub struct FieldAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const SYNTHETIC = 0x1000;
    }
}

/// Visibility shared by fields and methods, used for access checks
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Package,
    Private,
}

impl MethodAccessFlags {
    pub fn visibility(self) -> Visibility {
        if self.contains(MethodAccessFlags::PUBLIC) {
            Visibility::Public
        } else if self.contains(MethodAccessFlags::PROTECTED) {
            Visibility::Protected
        } else if self.contains(MethodAccessFlags::PRIVATE) {
            Visibility::Private
        } else {
            Visibility::Package
        }
    }
}

impl FieldAccessFlags {
    pub fn visibility(self) -> Visibility {
        if self.contains(FieldAccessFlags::PUBLIC) {
            Visibility::Public
        } else if self.contains(FieldAccessFlags::PROTECTED) {
            Visibility::Protected
        } else if self.contains(FieldAccessFlags::PRIVATE) {
            Visibility::Private
        } else {
            Visibility::Package
        }
    }

    /// At most one of `PUBLIC`, `PRIVATE`, `PROTECTED` and never `FINAL` with `VOLATILE`
    pub fn is_well_formed(self, in_interface: bool) -> bool {
        let visibility = self
            & (FieldAccessFlags::PUBLIC | FieldAccessFlags::PRIVATE | FieldAccessFlags::PROTECTED);
        if visibility.bits().count_ones() > 1 {
            return false;
        }
        if self.contains(FieldAccessFlags::FINAL | FieldAccessFlags::VOLATILE) {
            return false;
        }
        if in_interface {
            let required =
                FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC | FieldAccessFlags::FINAL;
            return self.contains(required)
                && !self.intersects(FieldAccessFlags::PRIVATE | FieldAccessFlags::PROTECTED);
        }
        true
    }
}

impl MethodAccessFlags {
    pub fn is_well_formed(self, in_interface: bool) -> bool {
        let visibility = self
            & (MethodAccessFlags::PUBLIC | MethodAccessFlags::PRIVATE | MethodAccessFlags::PROTECTED);
        if visibility.bits().count_ones() > 1 {
            return false;
        }
        if self.contains(MethodAccessFlags::ABSTRACT) {
            let incompatible = MethodAccessFlags::FINAL
                | MethodAccessFlags::NATIVE
                | MethodAccessFlags::PRIVATE
                | MethodAccessFlags::STATIC
                | MethodAccessFlags::SYNCHRONIZED
                | MethodAccessFlags::STRICT;
            if self.intersects(incompatible) {
                return false;
            }
        }
        if in_interface {
            return self.contains(MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT);
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_flag_combinations() {
        assert!(FieldAccessFlags::PUBLIC.is_well_formed(false));
        assert!(!(FieldAccessFlags::PUBLIC | FieldAccessFlags::PRIVATE).is_well_formed(false));
        assert!(!(FieldAccessFlags::FINAL | FieldAccessFlags::VOLATILE).is_well_formed(false));
        assert!(!FieldAccessFlags::PUBLIC.is_well_formed(true));
    }

    #[test]
    fn abstract_methods() {
        let flags = MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT;
        assert!(flags.is_well_formed(true));
        assert!(!(flags | MethodAccessFlags::STATIC).is_well_formed(false));
    }
}
