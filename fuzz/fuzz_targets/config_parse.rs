//! Fuzz test for configuration file parsing
//!
//! Arbitrary TOML must parse or fail, and validation must never panic on
//! whatever parsed.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wisp_core::config::NodeConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<toml::Value, _> = toml::from_str(s);

        if let Ok(config) = NodeConfig::from_toml_str(s) {
            let _ = config.validate();
            let _ = config.keypair();
            let _ = config.bootstrap();
            let _ = config.relay_infos();
        }
    }
});
