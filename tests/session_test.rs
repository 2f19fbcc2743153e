//! Tests for the file-backed session cache.

use llamapod::session::{FileSessionCache, SessionPersistence};
use llamapod::TokenId;

use std::path::PathBuf;

fn cache_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "llamapod-test-{tag}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn test_round_trip() {
    let dir = cache_dir("roundtrip");
    let cache = FileSessionCache::new(&dir);

    let tokens: Vec<TokenId> = vec![1, 15043, 29892, 3186, 29991];
    cache.save_tokens("chat-abc", &tokens).unwrap();
    assert_eq!(cache.load_tokens("chat-abc").unwrap(), Some(tokens));
}

#[test]
fn test_resave_overwrites() {
    let dir = cache_dir("resave");
    let cache = FileSessionCache::new(&dir);

    cache.save_tokens("s", &[1, 2, 3]).unwrap();
    cache.save_tokens("s", &[1, 2, 3, 4, 5]).unwrap();
    assert_eq!(cache.load_tokens("s").unwrap(), Some(vec![1, 2, 3, 4, 5]));
}

#[test]
fn test_empty_session_round_trips() {
    let dir = cache_dir("empty");
    let cache = FileSessionCache::new(&dir);

    cache.save_tokens("nothing", &[]).unwrap();
    assert_eq!(cache.load_tokens("nothing").unwrap(), Some(vec![]));
}

#[test]
fn test_missing_session_is_cache_miss() {
    let dir = cache_dir("missing");
    let cache = FileSessionCache::new(&dir);
    assert!(cache.load_tokens("never-existed").unwrap().is_none());
}

#[test]
fn test_garbage_file_is_cache_miss() {
    let dir = cache_dir("garbage");
    let cache = FileSessionCache::new(&dir);

    // Write a valid file first so the path layout matches, then clobber it.
    cache.save_tokens("victim", &[1, 2, 3]).unwrap();
    let file = std::fs::read_dir(&dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    std::fs::write(&file, b"\xde\xad\xbe\xef").unwrap();

    assert!(cache.load_tokens("victim").unwrap().is_none());
}

#[test]
fn test_sessions_are_independent() {
    let dir = cache_dir("independent");
    let cache = FileSessionCache::new(&dir);

    cache.save_tokens("a", &[10, 20]).unwrap();
    cache.save_tokens("b", &[30]).unwrap();
    assert_eq!(cache.load_tokens("a").unwrap(), Some(vec![10, 20]));
    assert_eq!(cache.load_tokens("b").unwrap(), Some(vec![30]));
}
