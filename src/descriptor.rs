//! Descriptor helpers: operand-stack slot counting and class-name rewriting.

use std::str::FromStr;

use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Slots a value of field descriptor `descriptor` occupies on the operand stack.
pub fn field_slots(descriptor: &str) -> usize {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        Some(b'V') | None => 0,
        _ => 1,
    }
}

/// Argument and return slots of a method descriptor, `None` if it does not parse.
pub fn method_slots(descriptor: &str) -> Option<(usize, usize)> {
    let parsed = MethodDescriptor::from_str(descriptor).ok()?;
    let arguments = parsed.parameter_types().iter().map(type_slots).sum();
    Some((arguments, type_slots(parsed.return_type())))
}

fn type_slots(descriptor: &TypeDescriptor) -> usize {
    match descriptor {
        TypeDescriptor::Void => 0,
        TypeDescriptor::Long | TypeDescriptor::Double => 2,
        _ => 1,
    }
}

/// Element class of an internal name or array descriptor, if it names a class at all.
///
/// `java/lang/String` and `[[Ljava/lang/String;` both yield `java/lang/String`;
/// primitive arrays yield `None`.
pub fn class_of(name: &str) -> Option<&str> {
    if !name.starts_with('[') {
        return Some(name);
    }
    let element = name.trim_start_matches('[');
    element.strip_prefix('L')?.strip_suffix(';')
}

/// Rewrites every class type naming `old` in a descriptor or generic signature.
///
/// The text is walked token by token, so type variables and type parameter names that happen
/// to start with `L` are left alone. Returns `None` when nothing matched or the text does not
/// parse, so callers can skip untouched entities.
pub fn rename_in_descriptor(text: &str, old: &str, new: &str) -> Option<String> {
    let mut rewriter = Rewriter {
        text,
        position: 0,
        old,
        new,
        output: String::with_capacity(text.len()),
        changed: false,
    };
    rewriter.signature()?;
    rewriter.changed.then_some(rewriter.output)
}

/// Rewrites an internal class name or array descriptor that refers to `old`.
pub fn rename_internal(name: &str, old: &str, new: &str) -> Option<String> {
    if name == old {
        return Some(new.to_string());
    }
    if name.starts_with('[') {
        return rename_in_descriptor(name, old, new);
    }
    None
}

/// Copies a descriptor or signature through, substituting class names.
struct Rewriter<'a> {
    text: &'a str,
    position: usize,
    old: &'a str,
    new: &'a str,
    output: String,
    changed: bool,
}

impl<'a> Rewriter<'a> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.position).copied()
    }

    /// Copies one ASCII token character.
    fn copy(&mut self) {
        let end = self.position + 1;
        self.output.push_str(&self.text[self.position..end]);
        self.position = end;
    }

    /// Consumes up to, not including, the first of `stops`.
    fn take_until(&mut self, stops: &[char]) -> Option<&'a str> {
        let text: &'a str = self.text;
        let length = text[self.position..].find(stops)?;
        let taken = &text[self.position..self.position + length];
        self.position += length;
        Some(taken)
    }

    /// Optional formal type parameters, then types and the `(`, `)` and `^` markers of a method.
    fn signature(&mut self) -> Option<()> {
        if self.peek() == Some(b'<') {
            self.formal_parameters()?;
        }
        while let Some(c) = self.peek() {
            match c {
                b'(' | b')' | b'^' => self.copy(),
                _ => self.type_signature()?,
            }
        }
        Some(())
    }

    fn formal_parameters(&mut self) -> Option<()> {
        self.copy();
        while self.peek()? != b'>' {
            let name = self.take_until(&[':'])?;
            self.output.push_str(name);
            while self.peek() == Some(b':') {
                self.copy();
                if matches!(self.peek(), Some(b'L' | b'T' | b'[')) {
                    self.type_signature()?;
                }
            }
        }
        self.copy();
        Some(())
    }

    fn type_signature(&mut self) -> Option<()> {
        match self.peek()? {
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b'V' => self.copy(),
            b'[' => {
                self.copy();
                self.type_signature()?;
            }
            b'T' => {
                self.copy();
                let variable = self.take_until(&[';'])?;
                self.output.push_str(variable);
                self.copy();
            }
            b'L' => self.class_type()?,
            _ => return None,
        }
        Some(())
    }

    fn class_type(&mut self) -> Option<()> {
        self.copy();
        let name = self.take_until(&[';', '<', '.'])?;
        if name == self.old {
            self.output.push_str(self.new);
            self.changed = true;
        } else {
            self.output.push_str(name);
        }
        loop {
            match self.peek()? {
                b';' => {
                    self.copy();
                    return Some(());
                }
                b'<' => self.type_arguments()?,
                b'.' => {
                    self.copy();
                    let inner = self.take_until(&[';', '<', '.'])?;
                    self.output.push_str(inner);
                }
                _ => return None,
            }
        }
    }

    fn type_arguments(&mut self) -> Option<()> {
        self.copy();
        while self.peek()? != b'>' {
            match self.peek()? {
                b'*' => self.copy(),
                b'+' | b'-' => {
                    self.copy();
                    self.type_signature()?;
                }
                _ => self.type_signature()?,
            }
        }
        self.copy();
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_counts_follow_category_two_types() {
        assert_eq!(field_slots("J"), 2);
        assert_eq!(field_slots("D"), 2);
        assert_eq!(field_slots("Ljava/lang/String;"), 1);
        assert_eq!(field_slots("[J"), 1);
        assert_eq!(method_slots("(IJLjava/lang/Object;D)V"), Some((6, 0)));
        assert_eq!(method_slots("()J"), Some((0, 2)));
        assert_eq!(method_slots("not a descriptor"), None);
    }

    #[test]
    fn renames_only_whole_class_tokens() {
        assert_eq!(
            rename_in_descriptor("(LFoo;[LFoo;I)LFoo;", "Foo", "Bar").as_deref(),
            Some("(LBar;[LBar;I)LBar;")
        );
        assert_eq!(rename_in_descriptor("(LFooBar;)V", "Foo", "Bar"), None);
        assert_eq!(rename_in_descriptor("(Lpkg/LFoo;)V", "Foo", "Bar"), None);
        assert_eq!(
            rename_in_descriptor("Ljava/util/List<LFoo;>;", "Foo", "Bar").as_deref(),
            Some("Ljava/util/List<LBar;>;")
        );
        assert_eq!(
            rename_in_descriptor("LFoo<TT;>;", "Foo", "Bar").as_deref(),
            Some("LBar<TT;>;")
        );
    }

    #[test]
    fn class_types_after_primitives_are_renamed() {
        assert_eq!(
            rename_in_descriptor("(ILFoo;)V", "Foo", "Bar").as_deref(),
            Some("(ILBar;)V")
        );
        assert_eq!(
            rename_in_descriptor("(JZLFoo;[LFoo;)LFoo;", "Foo", "Bar").as_deref(),
            Some("(JZLBar;[LBar;)LBar;")
        );
        assert_eq!(
            rename_in_descriptor("(BCDFSLFoo;)[[LFoo;", "Foo", "Bar").as_deref(),
            Some("(BCDFSLBar;)[[LBar;")
        );
    }

    #[test]
    fn signatures_rename_class_types_but_not_type_variables() {
        assert_eq!(
            rename_in_descriptor(
                "<T:LFoo;U::Ljava/lang/Comparable<-LFoo;>;>(TT;ILjava/util/List<+LFoo;>;)LFoo;^LFoo;",
                "Foo",
                "Bar"
            )
            .as_deref(),
            Some(
                "<T:LBar;U::Ljava/lang/Comparable<-LBar;>;>(TT;ILjava/util/List<+LBar;>;)LBar;^LBar;"
            )
        );
        // A type variable and a type parameter both named `LFoo`.
        assert_eq!(rename_in_descriptor("<LFoo:Ljava/lang/Object;>(TLFoo;)V", "Foo", "Bar"), None);
        assert_eq!(
            rename_in_descriptor("Ljava/util/Map<TK;LFoo;>.Entry<*>;", "Foo", "Bar").as_deref(),
            Some("Ljava/util/Map<TK;LBar;>.Entry<*>;")
        );
        assert_eq!(rename_in_descriptor("(LFoo", "Foo", "Bar"), None);
    }

    #[test]
    fn internal_names_and_arrays() {
        assert_eq!(rename_internal("Foo", "Foo", "Bar").as_deref(), Some("Bar"));
        assert_eq!(
            rename_internal("[[LFoo;", "Foo", "Bar").as_deref(),
            Some("[[LBar;")
        );
        assert_eq!(rename_internal("Foo$Inner", "Foo", "Bar"), None);
        assert_eq!(class_of("[[Ljava/lang/String;"), Some("java/lang/String"));
        assert_eq!(class_of("[I"), None);
        assert_eq!(class_of("java/lang/String"), Some("java/lang/String"));
    }
}
