use std::sync::Once;

use ferrite_blk::common::logger as core_logger;

static INIT: Once = Once::new();

pub fn init_test_logger() {
    INIT.call_once(|| {
        // keep CI output quiet unless RUST_LOG asks otherwise
        if std::env::var("RUST_LOG").is_err() {
            // single-threaded at this point, guarded by INIT
            unsafe {
                std::env::set_var("RUST_LOG", "warn");
            }
        }
        core_logger::initialize_logger();
    });
}
