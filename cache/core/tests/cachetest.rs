//! Single-threaded cache scenarios, exercised end to end through the
//! public verb surface.

use ember_cache::{Cache, CacheStatus, Domain, Rope};
use std::sync::Arc;

fn cache() -> Cache {
    let domain = Arc::new(Domain::new());
    domain.register();
    Cache::builder()
        .max_bytes(16 * 1024)
        .initial_lg2size(8)
        .domain(domain)
        .build()
}

fn set(cache: &Cache, key: &str, value: &str) {
    let status = cache.set(key.as_bytes(), 0, 0, Rope::from_bytes(value.as_bytes()));
    assert_eq!(status, CacheStatus::Stored);
}

fn add(cache: &Cache, key: &str, value: &str, expect_success: bool) {
    let status = cache.add(key.as_bytes(), 0, 0, Rope::from_bytes(value.as_bytes()));
    if expect_success {
        assert_eq!(status, CacheStatus::Stored);
    } else {
        assert_eq!(status, CacheStatus::SetError);
    }
}

fn get(cache: &Cache, key: &str, expect: Option<&str>) {
    match cache.get(key.as_bytes()) {
        None => assert_eq!(expect, None, "unexpected miss for {:?}", key),
        Some(entry) => {
            let expect = expect.unwrap_or_else(|| panic!("unexpected hit for {:?}", key));
            let mut remaining = expect.as_bytes();
            let mut data = entry.read();
            while let Some(part) = data.pop() {
                assert!(part.len() <= remaining.len());
                assert_eq!(part, &remaining[..part.len()]);
                remaining = &remaining[part.len()..];
            }
            assert!(remaining.is_empty(), "value shorter than expected");
        }
    }
}

fn incr(cache: &Cache, key: &str, delta: u64, expect: u64) {
    assert_eq!(cache.incr(key.as_bytes(), delta), Ok(expect));
}

#[test]
fn stores_and_misses() {
    let c = cache();
    add(&c, "pooh", "bear", true);
    add(&c, "pooh", "b33r", false);
    set(&c, "tigger", "too");
    get(&c, "pooh", Some("bear"));
    get(&c, "pooh", Some("bear"));
    get(&c, "tigger", Some("too"));
    get(&c, "piglet", None);
    get(&c, "piglet", None);
    set(&c, "pooh", "beer");
    get(&c, "pooh", Some("beer"));
    c.domain().exit();
}

#[test]
fn increment_and_decrement() {
    let c = cache();
    add(&c, "a", "1001", true);
    add(&c, "b", "0", true);
    incr(&c, "a", 1, 1002);
    incr(&c, "a", 1, 1003);
    assert_eq!(c.decr(b"b", 1), Ok(0));
    incr(&c, "b", 1, 1);
    incr(&c, "b", 1, 2);
    incr(&c, "b", 1000, 1002);
    assert_eq!(c.decr(b"absent", 1), Err(CacheStatus::NotFound));
    c.domain().exit();
}

#[test]
fn concatenation() {
    let c = cache();
    set(&c, "k", "bc");
    assert_eq!(c.append(b"k", Rope::from_bytes(b"d")), CacheStatus::Stored);
    assert_eq!(c.prepend(b"k", Rope::from_bytes(b"a")), CacheStatus::Stored);
    get(&c, "k", Some("abcd"));
    c.domain().exit();
}

#[test]
fn cas_round_trip() {
    let c = cache();
    set(&c, "x", "abcd");

    let entry = c.get(b"x").unwrap();
    let version = entry.read().hash(entry.flags() as u64);
    assert_eq!(
        c.cas(b"x", 0, 0, version, Rope::from_bytes(b"wxyz")),
        CacheStatus::Stored
    );
    get(&c, "x", Some("wxyz"));

    // replaying the stale version token must fail
    assert_eq!(
        c.cas(b"x", 0, 0, version, Rope::from_bytes(b"nope")),
        CacheStatus::CasExists
    );
    get(&c, "x", Some("wxyz"));
    c.domain().exit();
}

#[test]
fn stats_counters() {
    let c = cache();
    set(&c, "pooh", "bear");
    get(&c, "pooh", Some("bear"));
    get(&c, "piglet", None);
    c.flush_all(0);

    assert_eq!(c.set_count(), 1);
    assert_eq!(c.get_count(), 2);
    assert_eq!(c.get_hit_count(), 1);
    assert_eq!(c.get_miss_count(), 1);
    assert_eq!(c.flush_count(), 1);
    assert_eq!(c.bytes(), 4);
    assert!(c.buckets() >= 256);
    assert_eq!(c.keys(), 1);
    c.domain().exit();
}

#[test]
fn flush_all_takes_effect_at_collection() {
    let c = cache();
    set(&c, "pooh", "bear");
    c.flush_all(0);
    get(&c, "pooh", Some("bear"));
    c.collect();
    get(&c, "pooh", None);

    // values stored after the flush stamp survive
    set(&c, "tigger", "too");
    c.collect();
    get(&c, "tigger", Some("too"));
    c.domain().exit();
}

#[test]
fn survives_repeated_collection() {
    let c = cache();
    for i in 0..50u32 {
        set(&c, &format!("key-{}", i % 7), &format!("value-{}", i));
        if i % 5 == 0 {
            c.collect();
        }
    }
    c.collect();
    for i in 43..50u32 {
        get(&c, &format!("key-{}", i % 7), Some(&format!("value-{}", i)));
    }
    c.domain().exit();
}

#[test]
fn post_collection_byte_accounting() {
    let c = cache();
    set(&c, "a", "aaaa");
    set(&c, "b", "bb");
    set(&c, "a", "cccc");
    // replacing `a` released the old chain and subtracted it
    c.domain().checkpoint();
    c.collect();
    assert_eq!(c.bytes(), 6);
    c.domain().exit();
}
