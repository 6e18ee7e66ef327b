// Interned name storage
//
// Pass, node and resource names are compared constantly while the
// graph compiles, so we dedup them once into leaked storage and hand
// out `&'static str`s. Equal byte sequences always return the same
// pointer, which lets the rest of the runtime key hash maps on a
// cheap 64 bit hash of the name.

use fxhash::FxHashMap;
use std::sync::RwLock;

lazy_static::lazy_static! {
    static ref STRING_POOL: RwLock<FxHashMap<u64, &'static str>> =
        RwLock::new(FxHashMap::default());
}

/// Hash used for every name keyed map in the runtime.
pub(crate) fn hash_name(name: &str) -> u64 {
    fxhash::hash64(name.as_bytes())
}

/// Intern a name, returning a stable reference valid for the life of
/// the process. Interning the same bytes twice returns the same
/// pointer.
pub fn intern(name: &str) -> &'static str {
    if name.is_empty() {
        return "";
    }

    let key = hash_name(name);

    if let Some(s) = STRING_POOL.read().unwrap().get(&key).copied() {
        return s;
    }

    let mut pool = STRING_POOL.write().unwrap();
    // someone may have raced us between the locks
    if let Some(s) = pool.get(&key).copied() {
        return s;
    }

    let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
    pool.insert(key, leaked);
    leaked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_pointer_stable() {
        let a = intern("gbuffer-color");
        let b = intern(&String::from("gbuffer-color"));
        assert!(std::ptr::eq(a, b));
        assert_eq!(a, "gbuffer-color");
    }

    #[test]
    fn distinct_names_stay_distinct() {
        let a = intern("depth");
        let b = intern("depth-pyramid");
        assert!(!std::ptr::eq(a, b));
    }

    #[test]
    fn empty_round_trips() {
        assert_eq!(intern(""), "");
    }
}
