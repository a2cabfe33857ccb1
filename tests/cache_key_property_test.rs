//! Property-based tests for storage key derivation

use imgcache_proxy::cache_key::{derive_key, object_key, DIGEST_HEX_LEN};
use quickcheck::{QuickCheck, TestResult};
use quickcheck_macros::quickcheck;

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[quickcheck]
fn prop_key_is_deterministic(path: String) -> bool {
    derive_key(&path) == derive_key(&path)
}

#[quickcheck]
fn prop_key_is_32_lower_hex(path: String) -> bool {
    let key = derive_key(&path);
    key.len() == DIGEST_HEX_LEN && is_lower_hex(&key)
}

fn prop_distinct_paths_distinct_keys(a: String, b: String) -> TestResult {
    if a == b {
        return TestResult::discard();
    }
    TestResult::from_bool(derive_key(&a) != derive_key(&b))
}

#[test]
fn test_property_distinct_paths_distinct_keys() {
    QuickCheck::new()
        .tests(500)
        .quickcheck(prop_distinct_paths_distinct_keys as fn(String, String) -> TestResult);
}

#[quickcheck]
fn prop_empty_folder_is_bare_digest(path: String) -> bool {
    object_key("", &path) == derive_key(&path)
}

fn prop_folder_prefix_form(folder: String, path: String) -> TestResult {
    let trimmed = folder.trim_matches('/');
    if trimmed.is_empty() {
        return TestResult::discard();
    }
    let key = object_key(&folder, &path);
    TestResult::from_bool(key == format!("{}/{}", trimmed, derive_key(&path)))
}

#[test]
fn test_property_folder_prefix_form() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop_folder_prefix_form as fn(String, String) -> TestResult);
}

#[test]
fn test_near_identical_paths_differ() {
    // query strings and encoding variants are not canonicalized
    let base = "/_/rs:fill:50:50/plain/http%3A%2F%2Fminio%3A9000%2Fsource-images%2Fkitten.jpg";
    let variants = [
        format!("{}?v=1", base),
        base.replace("%3A", "%3a"),
        format!("{}/", base),
        base.replace("50:50", "50:51"),
    ];
    for variant in variants.iter() {
        assert_ne!(derive_key(base), derive_key(variant), "{}", variant);
    }
}
