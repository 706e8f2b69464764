//! Presence, insertion and removal of named cleanup markers.
//!
//! These only touch the in-memory object. Persisting is up to the caller.

use crate::SourceResource;

pub trait Finalizable {
    fn finalizers(&self) -> &[String];
    fn finalizers_mut(&mut self) -> &mut Vec<String>;
}

impl Finalizable for SourceResource {
    fn finalizers(&self) -> &[String] {
        &self.finalizers
    }
    fn finalizers_mut(&mut self) -> &mut Vec<String> {
        &mut self.finalizers
    }
}

pub fn has_finalizer<T: Finalizable + ?Sized>(obj: &T, name: &str) -> bool {
    obj.finalizers().iter().any(|f| f == name)
}

/// Returns true if the marker was added, false if it was already there.
pub fn add_finalizer<T: Finalizable + ?Sized>(obj: &mut T, name: &str) -> bool {
    if has_finalizer(obj, name) {
        return false;
    }
    obj.finalizers_mut().push(name.to_string());
    true
}

/// Returns true if the marker was present and removed.
pub fn remove_finalizer<T: Finalizable + ?Sized>(obj: &mut T, name: &str) -> bool {
    let list = obj.finalizers_mut();
    let before = list.len();
    list.retain(|f| f != name);
    list.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FINALIZER;

    #[test]
    fn add_is_idempotent() {
        let mut s = SourceResource::default();
        assert!(!has_finalizer(&s, FINALIZER));
        assert!(add_finalizer(&mut s, FINALIZER));
        assert!(!add_finalizer(&mut s, FINALIZER));
        assert_eq!(s.finalizers, vec![FINALIZER.to_string()]);
    }

    #[test]
    fn remove_leaves_foreign_markers() {
        let mut s = SourceResource { finalizers: vec!["other/keep".into(), FINALIZER.into()], ..Default::default() };
        assert!(remove_finalizer(&mut s, FINALIZER));
        assert!(!remove_finalizer(&mut s, FINALIZER));
        assert_eq!(s.finalizers, vec!["other/keep".to_string()]);
    }
}
