//! Environment sanitisation: the build environment is scrubbed for the
//! guarded block and restored exactly afterwards, panics included.
//!
//! Everything runs inside a single test function because the process
//! environment is global state.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use forgepool::worker::with_environment;

fn snapshot() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[test]
fn sanitised_block_sees_scrubbed_environment_and_restores_it() {
    std::env::set_var("GEM_HOME", "/gems");
    std::env::set_var("GEM_PATH", "/gems/path");
    std::env::set_var("BUNDLE_GEMFILE", "Gemfile.ci");
    std::env::set_var("RUBYOPT", "-W0");
    std::env::set_var("RAILS_ENV", "production");
    std::env::set_var("SOMETOOL_VERSION", "1.2.3");
    std::env::set_var("SOMETOOL_DIR", "/opt/sometool");
    std::env::set_var("HARMLESS_SETTING", "kept");
    std::env::set_var("RBENV_ROOT", "/opt/rbenv");
    let original_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var(
        "PATH",
        format!("/opt/rbenv/versions/3.2/bin:{original_path}"),
    );

    let before = snapshot();

    with_environment(|| {
        assert!(std::env::var("GEM_HOME").is_err());
        assert!(std::env::var("GEM_PATH").is_err());
        assert!(std::env::var("BUNDLE_GEMFILE").is_err());
        assert!(std::env::var("RUBYOPT").is_err());
        assert!(std::env::var("RAILS_ENV").is_err());
        assert!(std::env::var("SOMETOOL_VERSION").is_err());
        assert!(std::env::var("SOMETOOL_DIR").is_err());
        assert_eq!(std::env::var("HARMLESS_SETTING").unwrap(), "kept");

        let path = std::env::var("PATH").unwrap();
        assert!(!path.contains("/opt/rbenv/versions/"));

        // Mutations inside the block are rolled back too.
        std::env::set_var("LEAKED_BY_BLOCK", "oops");
    });

    assert_eq!(snapshot(), before);
    assert!(std::env::var("LEAKED_BY_BLOCK").is_err());

    // A panicking block must restore the environment as well.
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        with_environment(|| {
            assert!(std::env::var("GEM_HOME").is_err());
            panic!("task blew up");
        })
    }));
    assert!(result.is_err());
    assert_eq!(snapshot(), before);

    for name in [
        "GEM_HOME",
        "GEM_PATH",
        "BUNDLE_GEMFILE",
        "RUBYOPT",
        "RAILS_ENV",
        "SOMETOOL_VERSION",
        "SOMETOOL_DIR",
        "HARMLESS_SETTING",
        "RBENV_ROOT",
    ] {
        std::env::remove_var(name);
    }
    std::env::set_var("PATH", original_path);
}
