/// Target VM profile
///
/// The profiles differ in the classfile versions they accept and in the maximum number of array
/// dimensions a type descriptor may have.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmProfile {
    /// Small embedded VM
    Minimal,

    /// Full VM
    Full,
}

impl VmProfile {
    /// Maximum number of dimensions in an array descriptor
    pub fn max_array_dimensions(self) -> usize {
        match self {
            VmProfile::Minimal => 31,
            VmProfile::Full => 255,
        }
    }

    /// Is the classfile version acceptable?
    ///
    /// Any `45.x`, or one of `46.0`, `47.0`, `48.0`.
    pub fn accepts_version(self, major: u16, minor: u16) -> bool {
        match major {
            45 => true,
            46 | 47 | 48 => minor == 0,
            _ => false,
        }
    }
}

pub struct Settings {
    pub profile: VmProfile,

    /// Materialize every live stack value at basic block boundaries
    pub constrain_stack: bool,

    /// Materialize every live stack value before instructions that may trigger a collection
    pub constrain_stack_for_gc: bool,

    /// Merge same-typed locals whose live ranges do not intersect
    pub optimize_locals: bool,

    /// Remove stores of default values into locals (the VM zeroes locals on entry)
    pub optimize_initializers: bool,

    /// Use receiver-relative field opcodes when a field is accessed through `this`
    pub optimize_this_field_access: bool,

    /// Drop `putstatic` instructions that target primitive constant fields
    pub remove_constant_puts: bool,

    /// Emit line number tables for translated methods
    pub emit_debug_info: bool,

    /// Check `Liveness` attributes against the computed liveness instead of ignoring them
    pub verify_liveness: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            profile: VmProfile::Minimal,
            constrain_stack: true,
            constrain_stack_for_gc: true,
            optimize_locals: true,
            optimize_initializers: true,
            optimize_this_field_access: true,
            remove_constant_puts: true,
            emit_debug_info: true,
            verify_liveness: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_gating() {
        let profile = VmProfile::Minimal;
        assert!(profile.accepts_version(45, 3));
        assert!(profile.accepts_version(48, 0));
        assert!(!profile.accepts_version(48, 1));
        assert!(!profile.accepts_version(49, 0));
        assert!(!profile.accepts_version(44, 0));
    }
}
