//! Scanners for names and descriptors found in classfiles
//!
//! See <https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.2>

/// Skip over one (possibly `/` qualified) name, returning the rest of the input
///
/// Accepts letters (ASCII or not), `_`, `$`, and digits after the first character of each
/// segment. When `slash_ok`, segments may be separated with `/`, but there can be no empty
/// segment and no leading or trailing `/`.
fn skip_over_field_name(name: &str, slash_ok: bool) -> Option<&str> {
    let mut last_was_slash = false;
    let mut first = true;
    for (idx, c) in name.char_indices() {
        let ok = if c.is_ascii() {
            c.is_ascii_alphabetic()
                || c == '_'
                || c == '$'
                || (!first && !last_was_slash && c.is_ascii_digit())
        } else {
            c.is_alphabetic()
        };
        if ok {
            last_was_slash = false;
            first = false;
            continue;
        }
        if slash_ok && c == '/' && !first && !last_was_slash {
            last_was_slash = true;
            continue;
        }
        return if first || last_was_slash {
            None
        } else {
            Some(&name[idx..])
        };
    }
    if first || last_was_slash {
        None
    } else {
        Some("")
    }
}

/// Skip over one field type, returning the rest of the input
fn skip_over_field_type(descriptor: &str, void_ok: bool, max_dimensions: usize) -> Option<&str> {
    let mut rest = descriptor;
    let mut dimensions = 0;
    while let Some(after) = rest.strip_prefix('[') {
        dimensions += 1;
        if dimensions > max_dimensions {
            return None;
        }
        rest = after;
    }
    let (first, after) = match rest.as_bytes().first() {
        Some(byte) => (*byte, &rest[1..]),
        None => return None,
    };
    match first {
        b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D' => Some(after),
        b'V' if void_ok && dimensions == 0 => Some(after),
        b'L' => {
            let after = skip_over_field_name(after, true)?;
            after.strip_prefix(';')
        }
        _ => None,
    }
}

/// Field names, method names (other than `<init>`/`<clinit>`), simple class names
pub fn is_valid_unqualified_name(name: &str) -> bool {
    skip_over_field_name(name, false) == Some("")
}

/// Internal class name such as `java/lang/Object`
pub fn is_valid_qualified_name(name: &str) -> bool {
    skip_over_field_name(name, true) == Some("")
}

/// Name in a `CONSTANT_Class` entry: an internal class name or an array descriptor
pub fn is_valid_class_name(name: &str, max_dimensions: usize) -> bool {
    if name.starts_with('[') {
        is_valid_field_descriptor(name, max_dimensions)
    } else {
        is_valid_qualified_name(name)
    }
}

pub fn is_valid_field_descriptor(descriptor: &str, max_dimensions: usize) -> bool {
    skip_over_field_type(descriptor, false, max_dimensions) == Some("")
}

pub fn is_valid_method_descriptor(descriptor: &str, max_dimensions: usize) -> bool {
    let mut rest = match descriptor.strip_prefix('(') {
        Some(rest) => rest,
        None => return false,
    };
    while !rest.starts_with(')') {
        rest = match skip_over_field_type(rest, false, max_dimensions) {
            Some(rest) => rest,
            None => return false,
        };
    }
    skip_over_field_type(&rest[1..], true, max_dimensions) == Some("")
}

/// Method name, checked against its descriptor for the special initializer names
pub fn is_valid_method_name(name: &str, descriptor: &str) -> bool {
    match name {
        "<init>" => descriptor.ends_with(")V"),
        "<clinit>" => descriptor == "()V",
        _ => is_valid_unqualified_name(name),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unqualified_names() {
        assert!(is_valid_unqualified_name("foo"));
        assert!(is_valid_unqualified_name("$x_1"));
        assert!(is_valid_unqualified_name("été"));
        assert!(!is_valid_unqualified_name("1abc"));
        assert!(!is_valid_unqualified_name(""));
        assert!(!is_valid_unqualified_name("a/b"));
        assert!(!is_valid_unqualified_name("a;"));
    }

    #[test]
    fn qualified_names() {
        assert!(is_valid_qualified_name("java/lang/Object"));
        assert!(!is_valid_qualified_name("/java/lang"));
        assert!(!is_valid_qualified_name("java/lang/"));
        assert!(!is_valid_qualified_name("java//lang"));
        assert!(!is_valid_qualified_name("java/1lang"));
    }

    #[test]
    fn field_descriptors() {
        assert!(is_valid_field_descriptor("I", 31));
        assert!(is_valid_field_descriptor("[[J", 31));
        assert!(is_valid_field_descriptor("Ljava/lang/String;", 31));
        assert!(!is_valid_field_descriptor("V", 31));
        assert!(!is_valid_field_descriptor("Ljava/lang/String", 31));
        assert!(!is_valid_field_descriptor("II", 31));
        assert!(!is_valid_field_descriptor("L;", 31));
    }

    #[test]
    fn dimension_limit() {
        let thirty_two = format!("{}I", "[".repeat(32));
        assert!(!is_valid_field_descriptor(&thirty_two, 31));
        assert!(is_valid_field_descriptor(&thirty_two, 255));
        assert!(is_valid_class_name(&thirty_two, 255));
        assert!(!is_valid_class_name(&thirty_two, 31));
    }

    #[test]
    fn method_descriptors() {
        assert!(is_valid_method_descriptor("()V", 31));
        assert!(is_valid_method_descriptor("(IJLjava/lang/Object;[D)[I", 31));
        assert!(!is_valid_method_descriptor("(V)V", 31));
        assert!(!is_valid_method_descriptor("()", 31));
        assert!(!is_valid_method_descriptor("(I", 31));
        assert!(!is_valid_method_descriptor("()[V", 31));
    }

    #[test]
    fn method_names() {
        assert!(is_valid_method_name("<init>", "(I)V"));
        assert!(!is_valid_method_name("<init>", "()I"));
        assert!(is_valid_method_name("<clinit>", "()V"));
        assert!(!is_valid_method_name("<clinit>", "(I)V"));
        assert!(!is_valid_method_name("<foo>", "()V"));
        assert!(is_valid_method_name("run", "()V"));
    }
}
