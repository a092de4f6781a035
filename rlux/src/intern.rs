//! The process-wide string table. Every string the runtime creates goes
//! through here, so two `Value::Str` handles are equal exactly when their
//! contents are equal. There is no non-interned string value anywhere in the
//! crate; operations that build new strings (concatenation, subscripting)
//! return already-canonical ids.

use std::cell::RefCell;

use string_interner::{backend::BucketBackend, symbol::SymbolU32, DefaultHashBuilder};

use crate::MAX_STACK;

/// Default string interner
pub type StringInterner<B = BucketBackend<StrId>, H = DefaultHashBuilder> =
    string_interner::StringInterner<StrId, B, H>;

/// Interned string id
pub type StrId = SymbolU32;

thread_local! {
    static INTERN: RefCell<StringInterner> = RefCell::new(StringInterner::with_capacity(MAX_STACK));
}

/// Intern a string if it has not been allocated by the global interner,
/// otherwise, returning the existing reference for that string.
pub fn id<S: AsRef<str>>(s: S) -> StrId {
    INTERN.with(|intern| intern.borrow_mut().get_or_intern(s))
}

/// Get the string reference from the global interner using its id.
pub fn str(id: StrId) -> String {
    INTERN.with(|intern| {
        intern
            .borrow()
            .resolve(id)
            .expect("String must be allocated prior to access.")
            .to_string()
    })
}

/// Join two interned strings, returning the canonical id of the result.
pub fn concat(a: StrId, b: StrId) -> StrId {
    INTERN.with(|intern| {
        let mut intern = intern.borrow_mut();
        let mut joined = intern
            .resolve(a)
            .expect("String must be allocated prior to access.")
            .to_string();
        joined += intern
            .resolve(b)
            .expect("String must be allocated prior to access.");
        intern.get_or_intern(joined)
    })
}

/// The one-character string at the index, already interned, or `None` when
/// the index is past the last character.
pub fn char_at(id: StrId, idx: usize) -> Option<StrId> {
    INTERN.with(|intern| {
        let mut intern = intern.borrow_mut();
        let c = intern
            .resolve(id)
            .expect("String must be allocated prior to access.")
            .chars()
            .nth(idx)?;
        Some(intern.get_or_intern(c.to_string()))
    })
}

/// Number of characters in the interned string.
pub fn char_count(id: StrId) -> usize {
    INTERN.with(|intern| {
        intern
            .borrow()
            .resolve(id)
            .expect("String must be allocated prior to access.")
            .chars()
            .count()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_shares_one_id() {
        let a = id("hello");
        let b = id(String::from("hel") + "lo");
        assert_eq!(a, b);
        assert_eq!(str(a), "hello");
    }

    #[test]
    fn distinct_content_gets_distinct_ids() {
        assert_ne!(id("left"), id("right"));
    }

    #[test]
    fn concat_returns_the_canonical_id() {
        let joined = concat(id("foo"), id("bar"));
        assert_eq!(joined, id("foobar"));
    }

    #[test]
    fn char_at_interns_one_character_strings() {
        let s = id("héllo");
        assert_eq!(char_at(s, 1), Some(id("é")));
        assert_eq!(char_at(s, 4), Some(id("o")));
        assert_eq!(char_at(s, 5), None);
    }

    #[test]
    fn char_count_counts_characters_not_bytes() {
        assert_eq!(char_count(id("héllo")), 5);
        assert_eq!(char_count(id("")), 0);
    }
}
