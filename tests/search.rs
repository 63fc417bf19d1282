mod common;

use soloader::{SEARCH_PATHS, SoLoader, find_library_path};

#[test]
fn absolute_paths_bypass_the_search() {
    common::init_logging();
    let path = common::write_temp("search", b"not an elf");
    let path_str = path.to_str().unwrap().to_string();
    assert_eq!(find_library_path(&path_str), Some(path_str.clone()));
}

#[test]
fn missing_absolute_path_fails() {
    common::init_logging();
    assert_eq!(find_library_path("/nonexistent/dir/libfoo.so"), None);
}

#[test]
fn missing_relative_name_fails() {
    common::init_logging();
    assert_eq!(find_library_path("libsoloader_surely_missing_4242.so"), None);
}

#[test]
fn search_path_order_is_fixed() {
    assert_eq!(SEARCH_PATHS[0], "/apex/com.android.runtime/lib64/bionic/");
    assert_eq!(SEARCH_PATHS[3], "/system/lib64/");
    assert_eq!(*SEARCH_PATHS.last().unwrap(), "/system_ext/lib64/");
    assert_eq!(SEARCH_PATHS.len(), 12);
    assert!(SEARCH_PATHS.iter().all(|p| p.ends_with('/')));
}

#[test]
fn loader_rejects_junk_files() {
    common::init_logging();
    let path = common::write_temp("junk", b"this is not an elf file at all......");
    let mut loader = SoLoader::new();
    assert!(loader.load(path.to_str().unwrap()).is_err());
    assert!(!loader.is_loaded());
    assert!(loader.symbol("anything").is_none());
}

#[test]
fn loader_rejects_missing_files() {
    common::init_logging();
    let mut loader = SoLoader::new();
    assert!(loader.load("/nonexistent/definitely-not-here.so").is_err());
    assert!(!loader.is_loaded());
}

#[test]
fn unload_without_load_fails() {
    common::init_logging();
    let mut loader = SoLoader::new();
    assert!(loader.unload().is_err());
    assert!(loader.abandon().is_err());
    assert_eq!(loader.path(), "");
}
