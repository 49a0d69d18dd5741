#![no_main]

use libfuzzer_sys::fuzz_target;
use stackfold::filter::pattern;

fuzz_target!(|data: &[u8]| {
    if let Ok(patterns) = std::str::from_utf8(data) {
        if let Ok(regexes) = pattern::compile_list(patterns) {
            for regex in regexes {
                regex.is_match(patterns);
            }
        }
        pattern::parse_group_list(patterns).ok();
    }
});
